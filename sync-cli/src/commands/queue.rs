//! Inspect a SQLite offline queue.

use anyhow::{Context, Result};
use patchsync_client::{OfflineQueue, SqliteStore};
use patchsync_types::InstanceId;
use std::path::Path;
use std::sync::Arc;

use super::print_json;

async fn open(database: &Path, id: &str) -> Result<OfflineQueue> {
    if !database.exists() {
        anyhow::bail!("No queue database at {}", database.display());
    }
    let store = SqliteStore::open(database, &InstanceId::new(id))
        .await
        .with_context(|| format!("Failed to open {}", database.display()))?;
    Ok(OfflineQueue::new(Arc::new(store)))
}

/// Show queue counts.
pub async fn status(database: &Path, id: &str) -> Result<()> {
    let queue = open(database, id).await?;
    let status = queue.status().await?;

    println!("=== queue {id} ===");
    println!("  Pending: {}", status.pending);
    println!("  Failed:  {}", status.failed);
    Ok(())
}

/// Print queued entries, oldest first.
pub async fn list(database: &Path, id: &str) -> Result<()> {
    let queue = open(database, id).await?;
    print_json(&queue.entries().await?)
}

/// Drop every queued patch.
pub async fn clear(database: &Path, id: &str) -> Result<()> {
    let queue = open(database, id).await?;
    let pending = queue.status().await?.pending;
    queue.clear().await?;
    println!("Cleared {pending} queued patch(es) for {id}.");
    Ok(())
}
