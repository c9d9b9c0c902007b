//! Plugin hooks around the patch pipeline.
//!
//! A [`Plugin`] sees every patch at fixed points:
//!
//! ```text
//! update/sync → on_send → transport | queue
//! transport   → on_receive → resolve → apply → on_apply
//! ```
//!
//! `on_send` and `on_receive` may rewrite a patch or veto it by returning
//! `None`. A hook that errors or panics is reported as a
//! [`SyncEvent::PluginError`] and the pipeline carries on with the patch it
//! had before that hook.

use async_trait::async_trait;
use patchsync_types::{InstanceId, Patch, SourceId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::events::{EventBus, SyncEvent};

/// Error returned by a plugin hook.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    /// Create an error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The hook points of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// `on_init`
    Init,
    /// `on_send`
    Send,
    /// `on_receive`
    Receive,
    /// `on_apply`
    Apply,
    /// `on_destroy`
    Destroy,
}

impl HookKind {
    /// Hook method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "on_init",
            Self::Send => "on_send",
            Self::Receive => "on_receive",
            Self::Apply => "on_apply",
            Self::Destroy => "on_destroy",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a plugin learns about the session it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginContext {
    /// The replicated object.
    pub instance: InstanceId,
    /// This replica's source id.
    pub source: SourceId,
}

/// Extension point around the patch pipeline.
///
/// Every hook has a pass-through default.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique id. A second plugin with the same id is ignored.
    fn id(&self) -> &str;

    /// Called once when the session starts.
    async fn on_init(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called before a local patch leaves. `None` drops it.
    async fn on_send(&self, patch: Patch) -> Result<Option<Patch>, PluginError> {
        Ok(Some(patch))
    }

    /// Called when a peer's patch arrives. `None` drops it.
    async fn on_receive(&self, patch: Patch) -> Result<Option<Patch>, PluginError> {
        Ok(Some(patch))
    }

    /// Called after a received patch was applied.
    async fn on_apply(&self, _patch: &Patch) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called when the session ends.
    async fn on_destroy(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Ordered set of plugins with isolated hook execution.
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
    events: EventBus,
}

impl fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("plugins", &self.ids())
            .finish()
    }
}

impl PluginPipeline {
    /// Empty pipeline reporting to `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            plugins: Vec::new(),
            events,
        }
    }

    /// Add a plugin. Returns `false` if its id is already registered.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> bool {
        if self.plugins.iter().any(|p| p.id() == plugin.id()) {
            tracing::warn!(plugin = plugin.id(), "plugin already registered, ignoring");
            return false;
        }
        tracing::debug!(plugin = plugin.id(), "registered plugin");
        self.plugins.push(plugin);
        true
    }

    /// Registered plugin ids, in order.
    pub fn ids(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.id().to_string()).collect()
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run `on_init` on every plugin.
    pub async fn init(&self, ctx: &PluginContext) {
        for plugin in &self.plugins {
            let p = Arc::clone(plugin);
            let ctx = ctx.clone();
            let outcome = isolate(async move { p.on_init(&ctx).await }).await;
            if self.report(plugin.id(), HookKind::Init, outcome).is_some() {
                self.events.emit(SyncEvent::PluginLoaded {
                    id: plugin.id().to_string(),
                });
            }
        }
    }

    /// Run `on_send` hooks. `None` means a plugin vetoed the patch.
    pub async fn run_send(&self, patch: Patch) -> Option<Patch> {
        self.run_transform(HookKind::Send, patch).await
    }

    /// Run `on_receive` hooks. `None` means a plugin vetoed the patch.
    pub async fn run_receive(&self, patch: Patch) -> Option<Patch> {
        self.run_transform(HookKind::Receive, patch).await
    }

    /// Run `on_apply` hooks.
    pub async fn run_apply(&self, patch: &Patch) {
        for plugin in &self.plugins {
            let p = Arc::clone(plugin);
            let patch = patch.clone();
            let outcome = isolate(async move { p.on_apply(&patch).await }).await;
            self.report(plugin.id(), HookKind::Apply, outcome);
        }
    }

    /// Run `on_destroy` hooks.
    pub async fn destroy(&self) {
        for plugin in &self.plugins {
            let p = Arc::clone(plugin);
            let outcome = isolate(async move { p.on_destroy().await }).await;
            self.report(plugin.id(), HookKind::Destroy, outcome);
        }
    }

    async fn run_transform(&self, hook: HookKind, mut patch: Patch) -> Option<Patch> {
        for plugin in &self.plugins {
            let p = Arc::clone(plugin);
            let input = patch.clone();
            let outcome = isolate(async move {
                match hook {
                    HookKind::Send => p.on_send(input).await,
                    _ => p.on_receive(input).await,
                }
            })
            .await;

            match self.report(plugin.id(), hook, outcome) {
                Some(Some(next)) => patch = next,
                Some(None) => {
                    tracing::debug!(plugin = plugin.id(), hook = %hook, patch_id = %patch.id, "patch vetoed");
                    return None;
                }
                None => {}
            }
        }
        Some(patch)
    }

    fn report<T>(&self, id: &str, hook: HookKind, outcome: Result<T, PluginError>) -> Option<T> {
        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(plugin = id, hook = %hook, error = %e, "plugin hook failed");
                self.events.emit(SyncEvent::PluginError {
                    id: id.to_string(),
                    hook,
                    message: e.to_string(),
                });
                None
            }
        }
    }
}

/// Run a hook on its own task so a panic surfaces as an error.
async fn isolate<T, F>(hook: F) -> Result<T, PluginError>
where
    F: std::future::Future<Output = Result<T, PluginError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(hook).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(PluginError::new("hook panicked")),
        Err(e) => Err(PluginError::new(e.to_string())),
    }
}
