//! Validate a patch file.

use anyhow::Result;
use patchsync_core::validate_json;
use std::path::Path;

use super::read_json;

/// Run the validate command. Fails if the patch has any issue.
pub async fn run(patch: &Path) -> Result<()> {
    let value = read_json(patch).await?;
    let issues = validate_json(&value);
    if issues.is_empty() {
        println!("ok");
        return Ok(());
    }
    for issue in &issues {
        println!("  {issue}");
    }
    anyhow::bail!("{} issue(s) in {}", issues.len(), patch.display())
}
