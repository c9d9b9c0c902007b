//! Configuration for a watched object.
//!
//! A [`SyncConfig`] can be built in code or loaded from TOML:
//!
//! ```toml
//! id = "shopping-list"
//! strategy = "broadcast"
//! debounce_ms = 100
//! throttle_ms = 1000
//! paths = ["items", "owner.name"]
//! policy = "path-based"
//! detection = "overlapping"
//!
//! [queue]
//! database = "patchsync.db"
//! seen_capacity = 1024
//! ```
//!
//! A custom conflict resolver and plugins cannot be expressed in TOML; attach
//! them with [`SyncConfig::with_resolver`] and [`SyncConfig::with_plugin`].

use patchsync_core::{ConflictDetection, ConflictPolicy, ConflictResolver};
use patchsync_types::{InstanceId, PointerPath};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::plugin::Plugin;
use crate::transport::Strategy;

/// Configuration passed to `Coordinator::watch`.
#[derive(Clone, Deserialize)]
pub struct SyncConfig {
    /// Name of the replicated object (required, non-empty).
    #[serde(default)]
    pub id: String,
    /// Transport strategy used when the coordinator builds its own transport.
    #[serde(default)]
    pub strategy: Strategy,
    /// Quiet period before a local mutation is diffed (default: 100).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Minimum spacing between outbound diffs (default: 1000).
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    /// Dotted paths to replicate. Empty means the whole object.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Default conflict policy.
    #[serde(default)]
    pub policy: ConflictPolicy,
    /// How conflicting paths are detected.
    #[serde(default)]
    pub detection: ConflictDetection,
    /// Forwarded to tooling through `dev_tools_enabled`.
    #[serde(default)]
    pub enable_dev_tools: bool,
    /// Transport channel name (default: `patchsync:{id}`).
    #[serde(default)]
    pub channel: Option<String>,
    /// Offline queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Custom conflict resolver, used instead of `policy`.
    #[serde(skip)]
    pub resolver: Option<Arc<dyn ConflictResolver>>,
    /// Plugins registered when the session starts.
    #[serde(skip)]
    pub plugins: Vec<Arc<dyn Plugin>>,
}

/// Offline queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// SQLite database for the queue. In-memory when unset.
    pub database: Option<PathBuf>,
    /// Number of recently received patch ids remembered for deduplication
    /// (default: 1024).
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database: None,
            seen_capacity: default_seen_capacity(),
        }
    }
}

// Default value functions
fn default_debounce_ms() -> u64 {
    100
}

fn default_throttle_ms() -> u64 {
    1000
}

fn default_seen_capacity() -> usize {
    patchsync_core::seen::DEFAULT_CAPACITY
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("debounce_ms", &self.debounce_ms)
            .field("throttle_ms", &self.throttle_ms)
            .field("paths", &self.paths)
            .field("policy", &self.policy)
            .field("detection", &self.detection)
            .field("enable_dev_tools", &self.enable_dev_tools)
            .field("channel", &self.channel)
            .field("queue", &self.queue)
            .field(
                "resolver",
                &self.resolver.as_ref().map(|r| r.name().to_string()),
            )
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.id().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SyncConfig {
    /// Configuration for `id` with every default.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            strategy: Strategy::default(),
            debounce_ms: default_debounce_ms(),
            throttle_ms: default_throttle_ms(),
            paths: Vec::new(),
            policy: ConflictPolicy::default(),
            detection: ConflictDetection::default(),
            enable_dev_tools: false,
            channel: None,
            queue: QueueConfig::default(),
            resolver: None,
            plugins: Vec::new(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or has no `id`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingId);
        }
        Ok(())
    }

    /// The replicated object's id.
    pub fn instance_id(&self) -> InstanceId {
        InstanceId::new(self.id.clone())
    }

    /// Channel the transport joins.
    pub fn channel_name(&self) -> String {
        self.channel
            .clone()
            .unwrap_or_else(|| format!("patchsync:{}", self.id))
    }

    /// Path filter for diffing, or `None` to diff the whole object.
    pub fn path_filter(&self) -> Option<Vec<PointerPath>> {
        if self.paths.is_empty() {
            return None;
        }
        Some(self.paths.iter().map(|p| PointerPath::from_dotted(p)).collect())
    }

    /// Debounce delay.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Throttle window.
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    /// Set the transport strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the debounce delay in milliseconds.
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Set the throttle window in milliseconds.
    pub fn with_throttle_ms(mut self, ms: u64) -> Self {
        self.throttle_ms = ms;
        self
    }

    /// Restrict replication to these dotted paths.
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set conflict detection.
    pub fn with_detection(mut self, detection: ConflictDetection) -> Self {
        self.detection = detection;
        self
    }

    /// Use a custom conflict resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Register a plugin at watch time.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Set the transport channel name.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Persist the offline queue in a SQLite database.
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue.database = Some(path.into());
        self
    }

    /// Set how many received patch ids are remembered.
    pub fn with_seen_capacity(mut self, capacity: usize) -> Self {
        self.queue.seen_capacity = capacity;
        self
    }

    /// Turn on the dev tools flag.
    pub fn with_dev_tools(mut self, enabled: bool) -> Self {
        self.enable_dev_tools = enabled;
        self
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// No object id was configured.
    #[error("configuration has no id")]
    MissingId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = SyncConfig::new("doc");
        assert_eq!(config.strategy, Strategy::Broadcast);
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.throttle(), Duration::from_millis(1000));
        assert_eq!(config.policy, ConflictPolicy::LastWriteWins);
        assert_eq!(config.detection, ConflictDetection::ExactPath);
        assert_eq!(config.queue.seen_capacity, 1024);
        assert_eq!(config.channel_name(), "patchsync:doc");
        assert!(config.path_filter().is_none());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
            id = "list"
            strategy = "storage"
            debounce_ms = 10
            throttle_ms = 50
            paths = ["items", "owner.name"]
            policy = "path-based"
            detection = "overlapping"
            enable_dev_tools = true
            channel = "lists"

            [queue]
            database = "/tmp/q.db"
            seen_capacity = 16
        "#;
        let config: SyncConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.id, "list");
        assert_eq!(config.strategy, Strategy::Storage);
        assert_eq!(config.debounce_ms, 10);
        assert_eq!(config.policy, ConflictPolicy::PathBased);
        assert_eq!(config.detection, ConflictDetection::Overlapping);
        assert!(config.enable_dev_tools);
        assert_eq!(config.channel_name(), "lists");
        assert_eq!(config.queue.database, Some(PathBuf::from("/tmp/q.db")));
        assert_eq!(config.queue.seen_capacity, 16);
        assert_eq!(
            config.path_filter().unwrap(),
            vec!["/items".parse().unwrap(), "/owner/name".parse().unwrap()]
        );
    }

    #[test]
    fn parse_minimal_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(r#"id = "x""#).unwrap();
        assert_eq!(config.debounce_ms, 100);
        assert_eq!(config.throttle_ms, 1000);
        assert_eq!(config.queue.seen_capacity, 1024);
        assert!(config.queue.database.is_none());
    }

    #[test]
    fn missing_id_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "debounce_ms = 5").unwrap();

        assert!(matches!(
            SyncConfig::from_file(file.path()),
            Err(ConfigError::MissingId)
        ));
    }

    #[test]
    fn unreadable_file() {
        let result = SyncConfig::from_file(Path::new("/nonexistent/patchsync.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id = ").unwrap();
        assert!(matches!(
            SyncConfig::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
