//! Coordinator - the main interface for patchsync.
//!
//! This module provides [`Coordinator`], which keeps one watched JSON value
//! in sync with its replicas.
//!
//! # Architecture
//!
//! The coordinator uses a pure state machine (from sync-core) for the
//! session lifecycle and interprets the actions to perform actual I/O via
//! the [`Transport`] trait and the [`OfflineQueue`].
//!
//! ```text
//!   mutate → debounce → throttle → sync ─┐
//!   update ──────────────────────────────┼→ on_send → Transport | OfflineQueue
//!                                        │
//!   Transport → receive loop → on_receive → resolve → apply → on_apply
//!                    ↓
//!              sync-core (pure state machine, diff, conflict)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use patchsync_client::{Coordinator, MockTransport, SyncConfig};
//! use std::sync::Arc;
//!
//! let coordinator = Coordinator::new(Arc::new(MockTransport::new()));
//! coordinator.watch(json!({"items": []}), SyncConfig::new("list")).await?;
//! coordinator.update(vec![Operation::add("/items/-".parse()?, json!("milk"))]).await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use patchsync_core::{
    apply_operations, get, graft, project, Action, ConflictEngine, DiffEngine, Event, PatchError,
    SeenPatches, SessionEvent, SessionState,
};
use patchsync_types::{
    now_millis, Envelope, EnvelopeKind, InstanceId, Operation, Patch, PointerPath, SourceId,
    StateSnapshot, SyncError,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, SyncConfig};
use crate::events::{ErrorSource, EventBus, Origin, SyncEvent};
use crate::plugin::{PluginContext, PluginPipeline};
use crate::queue::{
    DurableStore, FlushReport, MemoryStore, OfflineQueue, QueueError, QueueStatus, SqliteStore,
};
use crate::scheduler::{Debouncer, Throttler};
use crate::transport::{Transport, TransportError, TransportFactory};

/// Recent writes (local patches and applied remote ones) kept as conflict
/// candidates for incoming patches.
const RECENT_CAPACITY: usize = 64;

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// `watch` was called on an active session.
    #[error("already watching")]
    AlreadyWatching,

    /// The operation needs an active session.
    #[error("not watching")]
    NotWatching,

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Offline queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] SyncError),
}

enum TransportSource {
    Fixed(Arc<dyn Transport>),
    Factory(TransportFactory),
}

/// Builder for [`Coordinator`].
#[derive(Default)]
pub struct CoordinatorBuilder {
    transport: Option<Arc<dyn Transport>>,
    factory: Option<TransportFactory>,
    store: Option<Arc<dyn DurableStore>>,
    source: Option<SourceId>,
    events: Option<EventBus>,
}

impl CoordinatorBuilder {
    /// Use this transport for every session.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build transports from this factory using the configured strategy.
    pub fn factory(mut self, factory: TransportFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Back the offline queue with this store.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a fixed source id instead of a random one.
    pub fn source(mut self, source: SourceId) -> Self {
        self.source = Some(source);
        self
    }

    /// Report to an existing event bus.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the coordinator.
    pub fn build(self) -> Coordinator {
        let transport = match self.transport {
            Some(transport) => TransportSource::Fixed(transport),
            None => TransportSource::Factory(self.factory.unwrap_or_default()),
        };
        Coordinator {
            inner: Arc::new(Inner {
                source: self.source.unwrap_or_else(SourceId::random),
                events: self.events.unwrap_or_default(),
                transport,
                store: self.store,
                memory_stores: std::sync::Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }
}

/// Keeps one watched value in sync with its replicas.
///
/// Cloning is cheap and shares the session.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    source: SourceId,
    events: EventBus,
    transport: TransportSource,
    store: Option<Arc<dyn DurableStore>>,
    memory_stores: std::sync::Mutex<HashMap<InstanceId, Arc<MemoryStore>>>,
    generation: AtomicU64,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    machine: SessionState,
    session: Option<Session>,
}

/// Everything owned by one watch..unwatch span.
struct Session {
    generation: u64,
    config: SyncConfig,
    target: InstanceId,
    state: Value,
    diff: DiffEngine,
    filter: Option<Vec<PointerPath>>,
    conflicts: ConflictEngine,
    version: u64,
    authored: bool,
    adopted: bool,
    last_timestamp: i64,
    recent: VecDeque<Patch>,
    seen: SeenPatches,
    transport: Arc<dyn Transport>,
    queue: Arc<OfflineQueue>,
    plugins: Arc<PluginPipeline>,
    debouncer: Debouncer<()>,
    throttler: Arc<Throttler<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl Session {
    /// Stamp a new local patch.
    fn stamp(&mut self, source: SourceId, operations: Vec<Operation>) -> Patch {
        self.version += 1;
        self.last_timestamp = now_millis().max(self.last_timestamp + 1);
        self.authored = true;
        Patch::new(source, self.target.clone(), operations, self.version)
            .with_timestamp(self.last_timestamp)
    }

    fn remember(&mut self, patch: Patch) {
        self.recent.push_back(patch);
        while self.recent.len() > RECENT_CAPACITY {
            self.recent.pop_front();
        }
    }

    /// Record a handled remote patch, of which `applied` was written.
    ///
    /// Later local stamps sort after `incoming`. Older recent writes give up
    /// the paths it wrote, and it becomes the write to compare against there.
    fn observe(&mut self, incoming: &Patch, applied: &[Operation]) {
        self.seen.insert(incoming.id.clone());
        self.last_timestamp = self.last_timestamp.max(incoming.timestamp);
        if applied.is_empty() {
            return;
        }

        let detection = self.conflicts.detection();
        let written: Vec<&PointerPath> = applied.iter().flat_map(Operation::touched_paths).collect();
        for earlier in self
            .recent
            .iter_mut()
            .filter(|patch| patch.timestamp < incoming.timestamp)
        {
            earlier.operations.retain(|op| {
                !op.touched_paths()
                    .any(|path| written.iter().any(|w| detection.paths_conflict(path, w)))
            });
        }
        self.recent.retain(|patch| !patch.operations.is_empty());
        self.remember(Patch {
            operations: applied.to_vec(),
            ..incoming.clone()
        });
    }

    /// The shareable part of the state: the filtered subtrees, or everything.
    fn snapshot(&self) -> StateSnapshot {
        let state = match &self.filter {
            Some(paths) => project(&self.state, paths),
            None => self.state.clone(),
        };
        StateSnapshot {
            state,
            version: self.version,
        }
    }

    /// `snapshot` laid over the current state, limited to the filter.
    fn adopted_state(&self, snapshot: Value) -> Result<Value, PatchError> {
        let Some(paths) = &self.filter else {
            return Ok(snapshot);
        };
        let mut state = self.state.clone();
        for path in paths {
            if let Some(value) = get(&snapshot, path) {
                graft(&mut state, path, value.clone())?;
            }
        }
        Ok(state)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("source", &self.inner.source)
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl Coordinator {
    /// Coordinator that uses `transport` for every session.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder().transport(transport).build()
    }

    /// Start building a coordinator.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// This replica's source id.
    pub fn source_id(&self) -> SourceId {
        self.inner.source
    }

    /// The event bus applications subscribe to.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start replicating `state`.
    ///
    /// A failed connection does not fail the call: the session keeps
    /// watching disconnected and local patches go to the offline queue.
    pub async fn watch(&self, state: Value, config: SyncConfig) -> Result<(), CoordinatorError> {
        config.validate()?;
        let mut shared = self.inner.shared.lock().await;
        if shared.machine.is_watching() {
            return Err(CoordinatorError::AlreadyWatching);
        }

        let target = config.instance_id();
        let store = self.resolve_store(&config, &target).await?;
        let transport = match &self.inner.transport {
            TransportSource::Fixed(transport) => Arc::clone(transport),
            TransportSource::Factory(factory) => factory.create(config.strategy),
        };
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let mut plugins = PluginPipeline::new(self.inner.events.clone());
        for plugin in &config.plugins {
            plugins.register(Arc::clone(plugin));
        }

        let mut conflicts = ConflictEngine::new()
            .with_detection(config.detection)
            .with_policy(config.policy);
        if let Some(resolver) = &config.resolver {
            conflicts = conflicts.with_resolver(Arc::clone(resolver));
        }

        let mut diff = DiffEngine::new();
        diff.set_initial_state(state.clone());

        let (debouncer, throttler) = self.timers(&config, generation);
        tracing::info!(
            id = %target,
            source = %self.inner.source,
            strategy = %config.strategy,
            "watching"
        );

        let session = Session {
            generation,
            filter: config.path_filter(),
            seen: SeenPatches::new(config.queue.seen_capacity),
            target: target.clone(),
            state,
            diff,
            conflicts,
            version: 0,
            authored: false,
            adopted: false,
            last_timestamp: 0,
            recent: VecDeque::new(),
            transport,
            queue: Arc::new(OfflineQueue::new(store)),
            plugins: Arc::new(plugins),
            debouncer,
            throttler,
            receiver: None,
            config,
        };
        let plugins = Arc::clone(&session.plugins);
        shared.session = Some(session);

        plugins
            .init(&PluginContext {
                instance: target,
                source: self.inner.source,
            })
            .await;

        self.dispatch(&mut shared, Event::WatchRequested).await;
        Ok(())
    }

    /// Stop replicating. Calling it without a session is a no-op.
    pub async fn unwatch(&self) {
        let mut shared = self.inner.shared.lock().await;
        if !shared.machine.is_watching() {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.dispatch(&mut shared, Event::UnwatchRequested).await;
        if let Some(session) = shared.session.take() {
            tracing::info!(id = %session.target, "unwatched");
        }
    }

    /// Apply `operations` to the watched value and send them as one patch.
    ///
    /// Returns `Ok(None)` when there was nothing to apply or the operations
    /// could not be applied; the latter is reported as an error event and
    /// leaves the value untouched.
    pub async fn update(
        &self,
        operations: Vec<Operation>,
    ) -> Result<Option<Patch>, CoordinatorError> {
        let mut shared = self.inner.shared.lock().await;
        let session = shared
            .session
            .as_mut()
            .ok_or(CoordinatorError::NotWatching)?;
        if operations.is_empty() {
            return Ok(None);
        }

        if let Err(e) = apply_operations(&mut session.state, &operations) {
            tracing::warn!(error = %e, "local update rejected");
            self.report(ErrorSource::Structural, e.to_string());
            return Ok(None);
        }
        if session.diff.absorb(&operations).is_err() {
            session.diff.set_initial_state(session.state.clone());
        }

        let patch = session.stamp(self.inner.source, operations);
        session.remember(patch.clone());
        self.inner.events.emit(SyncEvent::Update {
            state: session.state.clone(),
            patch: Some(patch.clone()),
            origin: Origin::Local,
        });

        self.route_outbound(&mut shared, patch.clone()).await?;
        Ok(Some(patch))
    }

    /// Run `f` on the watched value and schedule a sync.
    ///
    /// The change is diffed after the debounce delay, at most once per
    /// throttle window.
    pub async fn mutate<F>(&self, f: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(&mut Value),
    {
        let mut shared = self.inner.shared.lock().await;
        let session = shared
            .session
            .as_mut()
            .ok_or(CoordinatorError::NotWatching)?;
        f(&mut session.state);
        session.debouncer.call(());
        Ok(())
    }

    /// Diff the watched value against the last baseline and send the delta.
    ///
    /// Returns the patch, or `None` when nothing changed.
    pub async fn sync(&self) -> Result<Option<Patch>, CoordinatorError> {
        let mut shared = self.inner.shared.lock().await;
        self.sync_locked(&mut shared).await
    }

    /// Replay the offline queue through the transport, reconnecting first if
    /// needed.
    pub async fn flush_queue(&self) -> Result<FlushReport, CoordinatorError> {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.is_none() {
            return Err(CoordinatorError::NotWatching);
        }

        if !shared.machine.is_connected() {
            let flushed = self.dispatch(&mut shared, Event::ReconnectRequested).await;
            if !shared.machine.is_connected() {
                return Err(TransportError::NotConnected.into());
            }
            if let Some(report) = flushed {
                return Ok(report?);
            }
        }

        let session = shared
            .session
            .as_mut()
            .ok_or(CoordinatorError::NotWatching)?;
        Ok(self.flush_session(session).await?)
    }

    /// Retry the transport connection. Returns whether it is connected.
    pub async fn reconnect(&self) -> Result<bool, CoordinatorError> {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.is_none() {
            return Err(CoordinatorError::NotWatching);
        }
        self.dispatch(&mut shared, Event::ReconnectRequested).await;
        Ok(shared.machine.is_connected())
    }

    /// Ask connected peers for their full state.
    ///
    /// The first answer is adopted if this replica has not authored a patch.
    pub async fn request_snapshot(&self) -> Result<(), CoordinatorError> {
        let shared = self.inner.shared.lock().await;
        let session = shared.session.as_ref().ok_or(CoordinatorError::NotWatching)?;
        if !shared.machine.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        let bytes = Envelope::sync_request(self.inner.source).to_bytes()?;
        session.transport.send(&bytes).await?;
        Ok(())
    }

    /// Process an envelope as if the transport had delivered it.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        let generation = self.inner.generation.load(Ordering::Acquire);
        self.handle_envelope_for(generation, envelope).await;
    }

    /// A copy of the watched value.
    pub async fn state(&self) -> Option<Value> {
        let shared = self.inner.shared.lock().await;
        shared.session.as_ref().map(|s| s.state.clone())
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> SessionState {
        self.inner.shared.lock().await.machine
    }

    /// Status of the session's offline queue.
    pub async fn queue_status(&self) -> Result<QueueStatus, CoordinatorError> {
        let queue = {
            let shared = self.inner.shared.lock().await;
            let session = shared.session.as_ref().ok_or(CoordinatorError::NotWatching)?;
            Arc::clone(&session.queue)
        };
        Ok(queue.status().await?)
    }

    /// Whether the session was configured with dev tools enabled.
    pub async fn dev_tools_enabled(&self) -> bool {
        let shared = self.inner.shared.lock().await;
        shared
            .session
            .as_ref()
            .is_some_and(|s| s.config.enable_dev_tools)
    }

    // ===========================================
    // Session setup
    // ===========================================

    async fn resolve_store(
        &self,
        config: &SyncConfig,
        target: &InstanceId,
    ) -> Result<Arc<dyn DurableStore>, CoordinatorError> {
        if let Some(store) = &self.inner.store {
            return Ok(Arc::clone(store));
        }
        if let Some(path) = &config.queue.database {
            return Ok(Arc::new(SqliteStore::open(path, target).await?));
        }
        let mut stores = self
            .inner
            .memory_stores
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let store = stores
            .entry(target.clone())
            .or_insert_with(|| Arc::new(MemoryStore::new()));
        Ok(Arc::clone(store) as Arc<dyn DurableStore>)
    }

    fn timers(&self, config: &SyncConfig, generation: u64) -> (Debouncer<()>, Arc<Throttler<()>>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let throttler = Arc::new(Throttler::new(config.throttle(), move |()| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                Coordinator { inner }.sync_scheduled(generation).await;
            });
        }));

        let trailing = Arc::clone(&throttler);
        let debouncer = Debouncer::new(config.debounce(), move |()| trailing.call(()));
        (debouncer, throttler)
    }

    // ===========================================
    // State machine interpretation
    // ===========================================

    /// Feed `event` to the state machine and perform the resulting actions
    /// until no new events are produced.
    ///
    /// Returns the outcome of a queue flush if one ran.
    async fn dispatch(
        &self,
        shared: &mut Shared,
        event: Event,
    ) -> Option<Result<FlushReport, QueueError>> {
        let mut events = VecDeque::from([event]);
        let mut flushed = None;

        while let Some(event) = events.pop_front() {
            let (next, actions) = shared.machine.on_event(event);
            shared.machine = next;
            for action in actions {
                if let Some(event) = self.perform(shared, action, &mut flushed).await {
                    events.push_back(event);
                }
            }
        }
        flushed
    }

    async fn perform(
        &self,
        shared: &mut Shared,
        action: Action,
        flushed: &mut Option<Result<FlushReport, QueueError>>,
    ) -> Option<Event> {
        let session = shared.session.as_mut()?;
        match action {
            Action::Connect => {
                let channel = session.config.channel_name();
                tracing::debug!(channel = %channel, "connecting transport");
                return Some(match session.transport.connect(&channel).await {
                    Ok(()) => Event::ConnectSucceeded,
                    Err(e) => Event::ConnectFailed {
                        error: e.to_string(),
                    },
                });
            }
            Action::StartReceiving => self.start_receiving(session),
            Action::FlushQueue => {
                let result = self.flush_session(session).await;
                if let Err(e) = &result {
                    self.report(ErrorSource::Queue, e.to_string());
                }
                *flushed = Some(result);
            }
            Action::CancelTimers => {
                session.debouncer.cancel();
                session.throttler.cancel();
            }
            Action::DestroyPlugins => session.plugins.destroy().await,
            Action::Disconnect => {
                if let Some(receiver) = session.receiver.take() {
                    receiver.abort();
                }
                if let Err(e) = session.transport.close().await {
                    tracing::warn!(error = %e, "transport close failed");
                }
            }
            Action::ResetBaseline => session.diff.reset(),
            Action::EmitEvent(event) => self.inner.events.emit(match event {
                SessionEvent::Connected => {
                    tracing::info!(id = %session.target, "connected");
                    SyncEvent::Connect
                }
                SessionEvent::Disconnected { reason } => {
                    tracing::info!(id = %session.target, reason = %reason, "disconnected");
                    SyncEvent::Disconnect { reason }
                }
                SessionEvent::ConnectFailed { error } => {
                    tracing::warn!(id = %session.target, error = %error, "connect failed");
                    SyncEvent::Error {
                        source: ErrorSource::Transport,
                        message: error,
                    }
                }
            }),
        }
        None
    }

    fn start_receiving(&self, session: &mut Session) {
        if let Some(previous) = session.receiver.take() {
            previous.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&session.transport);
        let generation = session.generation;

        session.receiver = Some(tokio::spawn(async move {
            loop {
                let received = transport.recv().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let coordinator = Coordinator { inner };
                match received {
                    Ok(bytes) => coordinator.receive(generation, &bytes).await,
                    Err(e) => {
                        coordinator.connection_lost(generation, e.to_string()).await;
                        break;
                    }
                }
            }
        }));
    }

    async fn connection_lost(&self, generation: u64, reason: String) {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        self.dispatch(&mut shared, Event::ConnectionLost { reason })
            .await;
    }

    async fn flush_session(&self, session: &Session) -> Result<FlushReport, QueueError> {
        let transport = Arc::clone(&session.transport);
        let events = self.inner.events.clone();
        session
            .queue
            .flush(|patch| {
                let transport = Arc::clone(&transport);
                let events = events.clone();
                async move {
                    let bytes = Envelope::patch(&patch)
                        .and_then(|envelope| envelope.to_bytes())
                        .map_err(|e| e.to_string())?;
                    transport.send(&bytes).await.map_err(|e| e.to_string())?;
                    events.emit(SyncEvent::Sync {
                        patch,
                        queued: false,
                    });
                    Ok::<(), String>(())
                }
            })
            .await
    }

    // ===========================================
    // Outbound
    // ===========================================

    async fn sync_scheduled(&self, generation: u64) {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        if let Err(e) = self.sync_locked(&mut shared).await {
            tracing::warn!(error = %e, "scheduled sync failed");
            self.report(ErrorSource::Queue, e.to_string());
        }
    }

    async fn sync_locked(&self, shared: &mut Shared) -> Result<Option<Patch>, CoordinatorError> {
        let session = shared
            .session
            .as_mut()
            .ok_or(CoordinatorError::NotWatching)?;
        let result = session
            .diff
            .generate(&session.state, session.filter.as_deref());
        if !result.has_changes {
            return Ok(None);
        }

        let patch = session.stamp(self.inner.source, result.operations);
        session.remember(patch.clone());
        tracing::debug!(patch_id = %patch.id, ops = patch.operations.len(), "local changes detected");
        self.route_outbound(shared, patch.clone()).await?;
        Ok(Some(patch))
    }

    /// Send hooks, then the transport if connected, else the queue.
    async fn route_outbound(&self, shared: &mut Shared, patch: Patch) -> Result<(), CoordinatorError> {
        let (plugins, transport, queue) = {
            let session = shared
                .session
                .as_ref()
                .ok_or(CoordinatorError::NotWatching)?;
            (
                Arc::clone(&session.plugins),
                Arc::clone(&session.transport),
                Arc::clone(&session.queue),
            )
        };

        let Some(patch) = plugins.run_send(patch).await else {
            return Ok(());
        };

        if shared.machine.is_connected() {
            let bytes = Envelope::patch(&patch)?.to_bytes()?;
            match transport.send(&bytes).await {
                Ok(()) => {
                    tracing::debug!(patch_id = %patch.id, "patch sent");
                    self.inner.events.emit(SyncEvent::Sync {
                        patch,
                        queued: false,
                    });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(patch_id = %patch.id, error = %e, "send failed, queueing patch");
                    if matches!(
                        e,
                        TransportError::NotConnected | TransportError::ConnectionClosed
                    ) {
                        self.dispatch(
                            shared,
                            Event::ConnectionLost {
                                reason: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
        }

        queue.enqueue(patch.clone()).await?;
        self.inner
            .events
            .emit(SyncEvent::Sync { patch, queued: true });
        Ok(())
    }

    // ===========================================
    // Inbound
    // ===========================================

    async fn receive(&self, generation: u64, bytes: &[u8]) {
        match Envelope::from_bytes(bytes) {
            Ok(envelope) => self.handle_envelope_for(generation, envelope).await,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable envelope");
                self.report(ErrorSource::Structural, e.to_string());
            }
        }
    }

    async fn handle_envelope_for(&self, generation: u64, envelope: Envelope) {
        if envelope.source == self.inner.source {
            tracing::trace!(kind = envelope.kind.as_str(), "dropping own envelope");
            return;
        }

        let mut shared = self.inner.shared.lock().await;
        let Some(session) = shared.session.as_mut() else {
            return;
        };
        if session.generation != generation {
            tracing::debug!("dropping envelope for a finished session");
            return;
        }

        match envelope.kind {
            EnvelopeKind::Ping => {
                let pong = Envelope::pong(self.inner.source);
                if let Err(e) = send_envelope(session.transport.as_ref(), &pong).await {
                    tracing::warn!(error = %e, "failed to answer ping");
                }
            }
            EnvelopeKind::Pong => {
                tracing::trace!(peer = %envelope.source, "pong");
            }
            EnvelopeKind::Sync => self.handle_sync(session, &envelope).await,
            EnvelopeKind::Patch => self.handle_patch(session, &envelope).await,
        }
    }

    async fn handle_sync(&self, session: &mut Session, envelope: &Envelope) {
        match envelope.to_snapshot() {
            Ok(None) => {
                let response = Envelope::sync_response(self.inner.source, &session.snapshot());
                let sent = match response {
                    Ok(response) => send_envelope(session.transport.as_ref(), &response).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    tracing::warn!(error = %e, "failed to answer snapshot request");
                }
            }
            Ok(Some(snapshot)) => {
                if session.authored || session.adopted {
                    tracing::debug!(peer = %envelope.source, "ignoring snapshot");
                    return;
                }
                let state = match session.adopted_state(snapshot.state) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!(error = %e, "snapshot does not fit the watched value");
                        self.report(ErrorSource::Structural, e.to_string());
                        return;
                    }
                };
                tracing::info!(peer = %envelope.source, version = snapshot.version, "adopting snapshot");
                session.state = state;
                session.diff.set_initial_state(session.state.clone());
                session.adopted = true;
                self.inner.events.emit(SyncEvent::Update {
                    state: session.state.clone(),
                    patch: None,
                    origin: Origin::Snapshot,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "invalid snapshot");
                self.report(ErrorSource::Structural, e.to_string());
            }
        }
    }

    async fn handle_patch(&self, session: &mut Session, envelope: &Envelope) {
        let incoming = match envelope.to_patch() {
            Ok(patch) => patch,
            Err(e) => {
                tracing::warn!(error = %e, "invalid patch payload");
                self.report(ErrorSource::Structural, e.to_string());
                return;
            }
        };

        let issues = session.conflicts.validate(&incoming);
        if !issues.is_empty() {
            let message = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(patch_id = %incoming.id, issues = %message, "rejecting invalid patch");
            self.report(ErrorSource::Validation, message);
            return;
        }
        if incoming.target != session.target || incoming.source == self.inner.source {
            return;
        }
        if session.seen.contains(&incoming.id) {
            tracing::debug!(patch_id = %incoming.id, "dropping duplicate patch");
            return;
        }

        let original = incoming.clone();
        let Some(incoming) = session.plugins.run_receive(incoming).await else {
            session.observe(&original, &[]);
            return;
        };

        // Newest recent write (local, or remote already applied) on the same paths.
        let local = session
            .recent
            .iter()
            .rev()
            .find(|local| session.conflicts.has_conflict(local, &incoming))
            .cloned();

        let applied = match local {
            None => incoming,
            Some(local) => {
                let resolution = session.conflicts.resolve(&local, &incoming, None);
                if let Some(failure) = &resolution.fallback {
                    tracing::warn!(error = %failure, "conflict resolver failed, using last-write-wins");
                    self.report(ErrorSource::Resolver, failure.to_string());
                }
                tracing::debug!(
                    local = %local.id,
                    incoming = %incoming.id,
                    resolution = ?resolution.patch.metadata.get("resolution"),
                    "resolved conflict"
                );
                let operations: Vec<Operation> = resolution
                    .patch
                    .operations
                    .iter()
                    .filter(|op| !local.operations.contains(op))
                    .cloned()
                    .collect();
                if local.source != incoming.source {
                    self.inner.events.emit(SyncEvent::Conflict {
                        local,
                        incoming,
                        resolved: resolution.patch.clone(),
                    });
                }
                Patch {
                    operations,
                    ..resolution.patch
                }
            }
        };

        if applied.operations.is_empty() {
            session.observe(&original, &[]);
            return;
        }
        if let Err(e) = apply_operations(&mut session.state, &applied.operations) {
            tracing::warn!(patch_id = %applied.id, error = %e, "failed to apply patch");
            self.report(ErrorSource::Structural, e.to_string());
            return;
        }
        session.observe(&original, &applied.operations);
        if let Err(e) = session.diff.absorb(&applied.operations) {
            tracing::debug!(error = %e, "baseline diverged from remote patch");
        }

        session.plugins.run_apply(&applied).await;
        tracing::debug!(patch_id = %applied.id, ops = applied.operations.len(), "applied remote patch");
        self.inner.events.emit(SyncEvent::Update {
            state: session.state.clone(),
            patch: Some(applied),
            origin: Origin::Remote,
        });
    }

    fn report(&self, source: ErrorSource, message: String) {
        self.inner.events.emit(SyncEvent::Error { source, message });
    }
}

async fn send_envelope(transport: &dyn Transport, envelope: &Envelope) -> Result<(), CoordinatorError> {
    transport.send(&envelope.to_bytes()?).await?;
    Ok(())
}
