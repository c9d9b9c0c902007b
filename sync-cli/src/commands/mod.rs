//! CLI command implementations.

pub mod apply;
pub mod diff;
pub mod queue;
pub mod resolve;
pub mod validate;

use anyhow::{Context, Result};
use patchsync_types::Patch;
use serde_json::Value;
use std::path::Path;

/// Read and parse a JSON file.
pub async fn read_json(path: &Path) -> Result<Value> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Read a patch file.
pub async fn read_patch(path: &Path) -> Result<Patch> {
    let value = read_json(path).await?;
    serde_json::from_value(value).with_context(|| format!("{} is not a patch", path.display()))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
