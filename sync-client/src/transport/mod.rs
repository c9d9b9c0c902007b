//! Transport abstraction for patchsync.
//!
//! This module provides a pluggable transport layer that abstracts the
//! channel replicas use to reach each other (in-process broadcast, storage
//! polling, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` joins a named channel
//! - `send()` transmits MessagePack envelope bytes to every peer on it
//! - `recv()` waits for the next envelope from a peer
//! - `close()` leaves the channel
//!
//! Strategies are independent adapters chosen through [`TransportFactory`];
//! the coordinator never branches on which one it holds.
//!
//! # Example
//!
//! ```ignore
//! let hub = BroadcastHub::new();
//! let transport = BroadcastTransport::new(hub.clone());
//! transport.connect("patchsync:doc").await?;
//! transport.send(&envelope.to_bytes()?).await?;
//! let bytes = transport.recv().await?;
//! ```

mod broadcast;
mod mock;
mod storage;

pub use broadcast::{BroadcastHub, BroadcastTransport};
pub use mock::MockTransport;
pub use storage::{SharedLog, StorageTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Maximum envelope size accepted by the in-process transports (4 MiB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Message exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message too large: {size} bytes (limit: {limit} bytes)")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

/// Transport trait for exchanging envelopes between replicas.
///
/// Implementations handle the underlying channel (in-process broadcast,
/// shared storage, mock, etc). A transport may deliver a replica's own
/// messages back to it; the coordinator filters those by source.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join the named channel.
    async fn connect(&self, channel: &str) -> Result<(), TransportError>;

    /// Send envelope bytes to every peer on the channel.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next envelope's bytes.
    ///
    /// Waits until data is available. Returns an error once the transport
    /// is closed.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Leave the channel.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Which adapter the coordinator builds when no transport is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Live in-process channel.
    #[default]
    Broadcast,
    /// Polling a shared log.
    Storage,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Broadcast => f.write_str("broadcast"),
            Strategy::Storage => f.write_str("storage"),
        }
    }
}

/// Builds transports for a [`Strategy`].
///
/// Replicas that should see each other must be built from factories sharing
/// the same hub and log (clone the factory).
#[derive(Debug, Clone)]
pub struct TransportFactory {
    hub: BroadcastHub,
    log: SharedLog,
    poll_interval: Duration,
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory {
    /// Factory with a fresh hub and log.
    pub fn new() -> Self {
        Self {
            hub: BroadcastHub::new(),
            log: SharedLog::new(),
            poll_interval: storage::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how often storage transports poll the log.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The hub shared by broadcast transports.
    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// The log shared by storage transports.
    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    /// Build a transport for `strategy`.
    pub fn create(&self, strategy: Strategy) -> Arc<dyn Transport> {
        match strategy {
            Strategy::Broadcast => Arc::new(BroadcastTransport::new(self.hub.clone())),
            Strategy::Storage => Arc::new(
                StorageTransport::new(self.log.clone()).with_poll_interval(self.poll_interval),
            ),
        }
    }
}

fn check_size(data: &[u8]) -> Result<(), TransportError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: data.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_transports_share_channels() {
        for strategy in [Strategy::Broadcast, Strategy::Storage] {
            let factory = TransportFactory::new().with_poll_interval(Duration::from_millis(5));
            let a = factory.create(strategy);
            let b = factory.create(strategy);
            a.connect("doc").await.unwrap();
            b.connect("doc").await.unwrap();

            a.send(b"hello").await.unwrap();

            let got = tokio::time::timeout(Duration::from_secs(1), b.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, b"hello", "strategy {strategy}");
        }
    }

    #[test]
    fn strategy_defaults_to_broadcast() {
        assert_eq!(Strategy::default(), Strategy::Broadcast);
        let parsed: Strategy = serde_json::from_str("\"storage\"").unwrap();
        assert_eq!(parsed, Strategy::Storage);
    }

    #[test]
    fn oversized_message_rejected() {
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            check_size(&big),
            Err(TransportError::MessageTooLarge { .. })
        ));
    }
}
