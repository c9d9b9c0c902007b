//! In-memory store for tests and ephemeral sessions.

use super::{DurableStore, QueueError};
use async_trait::async_trait;
use patchsync_types::{PatchId, QueueEntry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Store that keeps entries in a map. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<PatchId, QueueEntry>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`QueueError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(QueueError::Unavailable("memory store disabled".into()));
        }
        Ok(())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<PatchId, QueueEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.check()?;
        self.entries().insert(entry.id().clone(), entry.clone());
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.check()?;
        Ok(self.entries().values().cloned().collect())
    }

    async fn delete(&self, id: &PatchId) -> Result<(), QueueError> {
        self.check()?;
        self.entries().remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        self.check()?;
        self.entries().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_types::{InstanceId, Operation, Patch, SourceId};
    use serde_json::json;

    fn entry() -> QueueEntry {
        QueueEntry::new(Patch::new(
            SourceId::random(),
            InstanceId::new("doc"),
            vec![Operation::remove("/a".parse().unwrap())],
            1,
        ))
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        let e = entry();
        store.put(&e).await.unwrap();
        assert_eq!(store.get_all().await.unwrap(), vec![e.clone()]);

        store.delete(e.id()).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());

        // Deleting again is fine.
        store.delete(e.id()).await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.put(&entry()).await.is_err());
        store.set_unavailable(false);
        assert!(store.put(&entry()).await.is_ok());
    }
}
