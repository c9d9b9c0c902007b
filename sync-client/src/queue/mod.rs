//! Offline queue for patches that could not be delivered.
//!
//! The queue is the fallback path: the coordinator enqueues a patch when the
//! transport is down or a send fails, and replays the queue oldest-first
//! when the link comes back. Entries live in a [`DurableStore`], so a queue
//! backed by [`SqliteStore`] survives restarts.
//!
//! Delivery is at-least-once. A patch whose send succeeded but whose delete
//! failed is sent again on the next flush; receivers drop it by id.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use patchsync_types::{now_millis, Patch, PatchId, QueueEntry};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Queue and store errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored entry could not be decoded.
    #[error("corrupt queue entry {id}: {source}")]
    Corrupt {
        /// Patch id of the entry.
        id: String,
        /// Decoding error.
        source: serde_json::Error,
    },

    /// Entry could not be encoded for storage.
    #[error("failed to encode queue entry: {0}")]
    Encode(#[from] serde_json::Error),

    /// The store is not reachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value contract backing the offline queue.
///
/// A store holds the entries of one queue namespace.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or replace the entry with the same patch id.
    async fn put(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    /// Every stored entry, in no particular order.
    async fn get_all(&self) -> Result<Vec<QueueEntry>, QueueError>;

    /// Remove the entry for `id`. Removing a missing entry is not an error.
    async fn delete(&self, id: &PatchId) -> Result<(), QueueError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), QueueError>;
}

/// Snapshot of the queue for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Entries waiting for delivery.
    pub pending: usize,
    /// Whether a flush is running.
    pub processing: bool,
    /// Entries whose latest delivery attempt failed.
    pub failed: usize,
    /// Wall-clock milliseconds when the last flush finished.
    pub last_flush: Option<i64>,
}

/// Outcome of one [`OfflineQueue::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    /// Patches delivered and removed.
    pub sent: usize,
    /// Patches whose send failed; they stay queued.
    pub failed: usize,
    /// Patches not attempted because an earlier one failed.
    pub remaining: usize,
    /// The flush did not run because another was in progress.
    pub skipped: bool,
}

/// Clears the flush flag when dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable, non-reentrant queue of undelivered patches.
pub struct OfflineQueue {
    store: Arc<dyn DurableStore>,
    flushing: AtomicBool,
    last_flush: Mutex<Option<i64>>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("flushing", &self.flushing.load(Ordering::Relaxed))
            .finish()
    }
}

impl OfflineQueue {
    /// Create a queue over `store`.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            flushing: AtomicBool::new(false),
            last_flush: Mutex::new(None),
        }
    }

    /// Queue a patch.
    ///
    /// Re-queueing a patch id replaces the earlier patch but keeps its
    /// delivery record (enqueue time, attempts, last error).
    pub async fn enqueue(&self, patch: Patch) -> Result<(), QueueError> {
        let existing = self
            .store
            .get_all()
            .await?
            .into_iter()
            .find(|entry| entry.patch.id == patch.id);
        let entry = match existing {
            Some(mut entry) => {
                tracing::debug!(patch_id = %patch.id, attempts = entry.attempt_count, "re-queueing patch");
                entry.patch = patch;
                entry
            }
            None => {
                tracing::debug!(patch_id = %patch.id, "queueing patch for later delivery");
                QueueEntry::new(patch)
            }
        };
        self.store.put(&entry).await
    }

    /// Queued entries, oldest patch first.
    pub async fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let mut entries = self.store.get_all().await?;
        entries.sort_by(|a, b| {
            a.patch
                .timestamp
                .cmp(&b.patch.timestamp)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        Ok(entries)
    }

    /// Queued patches, oldest first. Entries stay queued until removed.
    pub async fn drain(&self) -> Result<Vec<Patch>, QueueError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|entry| entry.patch)
            .collect())
    }

    /// Remove delivered patches.
    pub async fn remove(&self, patches: &[Patch]) -> Result<(), QueueError> {
        for patch in patches {
            self.store.delete(&patch.id).await?;
        }
        Ok(())
    }

    /// Drop every queued patch.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.store.clear().await
    }

    /// Current queue status.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let entries = self.store.get_all().await?;
        Ok(QueueStatus {
            pending: entries.len(),
            processing: self.flushing.load(Ordering::Acquire),
            failed: entries.iter().filter(|e| e.has_failed()).count(),
            last_flush: *self.last_flush.lock().unwrap_or_else(|e| e.into_inner()),
        })
    }

    /// Whether a flush is running.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Send queued patches oldest-first through `send`.
    ///
    /// Delivered patches are removed. The first failure is recorded on its
    /// entry and stops the flush, so later patches never overtake an earlier
    /// one. A call made while another flush runs returns immediately with
    /// `skipped` set.
    pub async fn flush<F, Fut, E>(&self, send: F) -> Result<FlushReport, QueueError>
    where
        F: Fn(Patch) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("queue flush already in progress, skipping");
            return Ok(FlushReport {
                skipped: true,
                ..FlushReport::default()
            });
        }
        let _guard = FlushGuard(&self.flushing);

        let entries = self.entries().await?;
        let total = entries.len();
        let mut report = FlushReport::default();

        for (i, mut entry) in entries.into_iter().enumerate() {
            match send(entry.patch.clone()).await {
                Ok(()) => {
                    self.store.delete(entry.id()).await?;
                    report.sent += 1;
                }
                Err(e) => {
                    tracing::warn!(patch_id = %entry.id(), error = %e, "queued patch delivery failed");
                    entry.record_failure(e.to_string());
                    self.store.put(&entry).await?;
                    report.failed += 1;
                    report.remaining = total - i - 1;
                    break;
                }
            }
        }

        *self.last_flush.lock().unwrap_or_else(|e| e.into_inner()) = Some(now_millis());
        tracing::debug!(
            sent = report.sent,
            failed = report.failed,
            remaining = report.remaining,
            "queue flush finished"
        );
        Ok(report)
    }
}
