//! # sync-client
//!
//! Client library for patchsync state replication.
//!
//! This is the main library that applications use to keep a JSON value in
//! sync across replicas.
//!
//! ## Features
//!
//! - **Patch-based sync**: only structural deltas travel, never whole state
//! - **Offline-first**: undelivered patches persist in a durable queue
//!   (in-memory or SQLite) and replay on reconnect
//! - **Transport Abstraction**: pluggable transports (broadcast, storage
//!   polling, mock)
//! - **Conflict Resolution**: last-write-wins, merge, path-based or custom
//! - **Pure State Machine**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use patchsync_client::{Coordinator, SyncConfig, TransportFactory};
//!
//! let coordinator = Coordinator::builder()
//!     .factory(TransportFactory::new())
//!     .build();
//! coordinator.watch(json!({"items": []}), SyncConfig::new("list")).await?;
//!
//! coordinator.events().on(EventKind::Update, |event| println!("{event:?}"));
//! coordinator.mutate(|state| state["items"] = json!(["milk"])).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod events;
pub mod plugin;
pub mod queue;
pub mod scheduler;
pub mod transport;

pub use config::{ConfigError, QueueConfig, SyncConfig};
pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorError};
pub use events::{ErrorSource, EventBus, EventKind, HandlerId, Origin, SyncEvent};
pub use plugin::{HookKind, Plugin, PluginContext, PluginError, PluginPipeline};
pub use queue::{
    DurableStore, FlushReport, MemoryStore, OfflineQueue, QueueError, QueueStatus, SqliteStore,
};
pub use scheduler::{Debouncer, Throttler};
pub use transport::{
    BroadcastHub, BroadcastTransport, MockTransport, SharedLog, StorageTransport, Strategy,
    Transport, TransportError, TransportFactory, MAX_MESSAGE_SIZE,
};

pub use patchsync_core::{ConflictDetection, ConflictPolicy, ConflictResolver, ResolverError};
pub use patchsync_types::{Envelope, InstanceId, Operation, Patch, PatchId, PointerPath, SourceId};
