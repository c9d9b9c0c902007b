//! Apply operations to a document.

use anyhow::{Context, Result};
use patchsync_core::apply_operations;
use patchsync_types::{Operation, Patch};
use serde_json::Value;
use std::path::Path;

use super::{print_json, read_json};

/// Run the apply command.
pub async fn run(document: &Path, operations: &Path) -> Result<()> {
    let mut doc = read_json(document).await?;
    let ops = parse_operations(read_json(operations).await?)
        .with_context(|| format!("{} holds no operations", operations.display()))?;
    apply_operations(&mut doc, &ops)?;
    print_json(&doc)
}

/// Accept either a bare operation array or a whole patch.
pub fn parse_operations(value: Value) -> Result<Vec<Operation>> {
    if value.is_array() {
        return Ok(serde_json::from_value(value)?);
    }
    let patch: Patch = serde_json::from_value(value)?;
    Ok(patch.operations)
}
