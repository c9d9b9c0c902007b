//! Event surface for applications.
//!
//! The coordinator reports everything observable through [`SyncEvent`]s on
//! an [`EventBus`]. Handlers run synchronously, in registration order, on
//! the task that emitted the event.

use patchsync_types::Patch;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::plugin::HookKind;

/// Where an applied change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This replica's own update.
    Local,
    /// A patch from a peer.
    Remote,
    /// A peer's full snapshot adopted on join.
    Snapshot,
}

/// Subsystem that produced an [`SyncEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Operations could not be applied.
    Structural,
    /// A received patch failed validation.
    Validation,
    /// The transport failed.
    Transport,
    /// A custom conflict resolver failed.
    Resolver,
    /// The offline queue failed.
    Queue,
}

impl ErrorSource {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Validation => "validation",
            Self::Transport => "transport",
            Self::Resolver => "resolver",
            Self::Queue => "queue",
        }
    }
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The watched value changed.
    Update {
        /// The value after the change.
        state: Value,
        /// Patch that caused it, if any.
        patch: Option<Patch>,
        /// Where the change came from.
        origin: Origin,
    },
    /// A local patch left the coordinator.
    Sync {
        /// The outbound patch.
        patch: Patch,
        /// `true` when it went to the offline queue instead of the transport.
        queued: bool,
    },
    /// An incoming patch conflicted with a local one.
    Conflict {
        /// The local patch.
        local: Patch,
        /// The incoming patch.
        incoming: Patch,
        /// The resolution that was applied.
        resolved: Patch,
    },
    /// The transport connected.
    Connect,
    /// The transport disconnected.
    Disconnect {
        /// Reason for disconnection.
        reason: String,
    },
    /// Something failed without stopping the session.
    Error {
        /// Failing subsystem.
        source: ErrorSource,
        /// Human-readable description.
        message: String,
    },
    /// A plugin finished `on_init`.
    PluginLoaded {
        /// Plugin id.
        id: String,
    },
    /// A plugin hook failed.
    PluginError {
        /// Plugin id.
        id: String,
        /// Hook that failed.
        hook: HookKind,
        /// Error message.
        message: String,
    },
}

/// Event names handlers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`SyncEvent::Update`]
    Update,
    /// [`SyncEvent::Sync`]
    Sync,
    /// [`SyncEvent::Conflict`]
    Conflict,
    /// [`SyncEvent::Connect`]
    Connect,
    /// [`SyncEvent::Disconnect`]
    Disconnect,
    /// [`SyncEvent::Error`]
    Error,
    /// [`SyncEvent::PluginLoaded`]
    PluginLoaded,
    /// [`SyncEvent::PluginError`]
    PluginError,
}

impl EventKind {
    /// Event name as applications see it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Sync => "sync",
            Self::Conflict => "conflict",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::PluginLoaded => "plugin-loaded",
            Self::PluginError => "plugin-error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Update { .. } => EventKind::Update,
            Self::Sync { .. } => EventKind::Sync,
            Self::Conflict { .. } => EventKind::Conflict,
            Self::Connect => EventKind::Connect,
            Self::Disconnect { .. } => EventKind::Disconnect,
            Self::Error { .. } => EventKind::Error,
            Self::PluginLoaded { .. } => EventKind::PluginLoaded,
            Self::PluginError { .. } => EventKind::PluginError,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Registration {
    id: HandlerId,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<Registration>,
    subscribers: Vec<mpsc::UnboundedSender<SyncEvent>>,
}

/// Fan-out of [`SyncEvent`]s to registered handlers.
///
/// Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("EventBus")
            .field("handlers", &registry.handlers.len())
            .field("subscribers", &registry.subscribers.len())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Call `handler` for every event.
    pub fn on_all<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Unregister a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut registry = self.lock();
        let before = registry.handlers.len();
        registry.handlers.retain(|r| r.id != id);
        registry.handlers.len() != before
    }

    /// Receive every event on a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Deliver `event` to every matching handler.
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    pub fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut registry = self.lock();
            registry
                .subscribers
                .retain(|tx| tx.send(event.clone()).is_ok());
            registry
                .handlers
                .iter()
                .filter(|r| r.kind.map_or(true, |k| k == kind))
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(event = %kind, "event handler panicked");
            }
        }
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> HandlerId {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry.handlers.push(Registration { id, kind, handler });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn error(message: &str) -> SyncEvent {
        SyncEvent::Error {
            source: ErrorSource::Structural,
            message: message.into(),
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for n in 1..=3 {
            let seen = Arc::clone(&seen);
            bus.on_all(move |_| seen.lock().unwrap().push(n));
        }
        bus.emit(SyncEvent::Connect);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn kind_filter() {
        let bus = EventBus::new();
        let count = Arc::new(StdMutex::new(0));
        let c = Arc::clone(&count);
        bus.on(EventKind::Error, move |_| *c.lock().unwrap() += 1);

        bus.emit(SyncEvent::Connect);
        bus.emit(error("boom"));

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let reached = Arc::new(StdMutex::new(false));
        bus.on_all(|_| panic!("handler failure"));
        let r = Arc::clone(&reached);
        bus.on_all(move |_| *r.lock().unwrap() = true);

        bus.emit(SyncEvent::Connect);

        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn off_removes_handler() {
        let bus = EventBus::new();
        let count = Arc::new(StdMutex::new(0));
        let c = Arc::clone(&count);
        let id = bus.on_all(move |_| *c.lock().unwrap() += 1);

        bus.emit(SyncEvent::Connect);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(SyncEvent::Connect);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn subscribers_receive_clones() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(error("x"));
        assert_eq!(rx.try_recv().unwrap(), error("x"));
    }

    #[test]
    fn kind_names() {
        assert_eq!(EventKind::PluginError.as_str(), "plugin-error");
        assert_eq!(SyncEvent::Connect.kind(), EventKind::Connect);
    }
}
