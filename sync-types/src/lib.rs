//! # sync-types
//!
//! Wire format types for patchsync state replication.
//!
//! This crate provides the foundational types used across all patchsync crates:
//! - [`SourceId`], [`InstanceId`], [`PatchId`] - Identity types
//! - [`PointerPath`], [`Operation`] - Addressing and single structural edits
//! - [`Patch`], [`QueueEntry`] - Versioned bundles of operations
//! - [`Envelope`] - Message wrapper exchanged between peers
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod operation;
mod patch;

pub use envelope::{Envelope, EnvelopeKind, StateSnapshot};
pub use error::SyncError;
pub use ids::{now_millis, InstanceId, PatchId, SourceId};
pub use operation::{OpKind, Operation, PointerPath, Segment};
pub use patch::{Patch, QueueEntry};
