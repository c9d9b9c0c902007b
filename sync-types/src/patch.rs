//! Patches - identified, versioned bundles of operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{now_millis, InstanceId, Operation, PatchId, SourceId};

/// A versioned, timestamped bundle of operations describing a state delta.
///
/// `version` is strictly increasing per `source`. A patch is immutable once
/// created; conflict resolution produces new patches instead of editing
/// existing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Globally unique identifier.
    pub id: PatchId,
    /// Wall-clock milliseconds at creation.
    pub timestamp: i64,
    /// Replica that authored the patch.
    pub source: SourceId,
    /// Replicated object the patch applies to.
    pub target: InstanceId,
    /// Ordered operations.
    pub operations: Vec<Operation>,
    /// Per-source version.
    pub version: u64,
    /// Free-form annotations (resolution policy, plugin tags, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Patch {
    /// Create a patch stamped with a fresh id and the current time.
    pub fn new(
        source: SourceId,
        target: InstanceId,
        operations: Vec<Operation>,
        version: u64,
    ) -> Self {
        Self {
            id: PatchId::new(),
            timestamp: now_millis(),
            source,
            target,
            operations,
            version,
            metadata: Map::new(),
        }
    }

    /// Override the timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the patch carries no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A patch held by the offline queue, with queuing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The queued patch.
    pub patch: Patch,
    /// Wall-clock milliseconds when the patch was first queued.
    pub enqueued_at: i64,
    /// Delivery attempts made so far.
    #[serde(default)]
    pub attempt_count: u32,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueEntry {
    /// Wrap a patch that is being queued now.
    pub fn new(patch: Patch) -> Self {
        Self {
            patch,
            enqueued_at: now_millis(),
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Id of the queued patch.
    pub fn id(&self) -> &PatchId {
        &self.patch.id
    }

    /// Whether the most recent delivery attempt failed.
    pub fn has_failed(&self) -> bool {
        self.attempt_count > 0
    }

    /// Record a failed delivery attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error.into());
    }
}
