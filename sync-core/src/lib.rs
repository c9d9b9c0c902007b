//! # sync-core
//!
//! Pure logic for patchsync (no I/O, instant tests).
//!
//! This crate implements diffing, operation application, conflict
//! resolution and the session state machine without any network, disk or
//! timer I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transport, durable queue, timers) is performed by
//! `sync-client`, which interprets the actions produced by these modules.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply;
pub mod conflict;
pub mod diff;
pub mod seen;
pub mod state;
pub mod validate;

pub use apply::{apply_operation, apply_operations, get, graft, project, PatchError, StructuralError};
pub use conflict::{
    ConflictDetection, ConflictEngine, ConflictPolicy, ConflictResolver, Resolution,
    ResolverError, ResolverFailure,
};
pub use diff::{deep_equal, diff, diff_filtered, DiffEngine, DiffResult};
pub use seen::SeenPatches;
pub use state::{Action, Event, LinkState, SessionEvent, SessionState};
pub use validate::{validate, validate_json, ValidationIssue};
