//! In-process broadcast transport.
//!
//! Every transport connected to the same channel name on the same
//! [`BroadcastHub`] receives every message sent on it, including its own.

use super::{check_size, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// Per-channel buffer before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Registry of named broadcast channels shared by a set of replicas.
#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>>,
}

impl BroadcastHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Arc<Vec<u8>>> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of transports currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

struct Link {
    tx: broadcast::Sender<Arc<Vec<u8>>>,
    rx: Arc<tokio::sync::Mutex<broadcast::Receiver<Arc<Vec<u8>>>>>,
}

/// Transport over a [`BroadcastHub`] channel.
pub struct BroadcastTransport {
    hub: BroadcastHub,
    link: Mutex<Option<Link>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for BroadcastTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastTransport")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl BroadcastTransport {
    /// Create a transport on `hub`. Call `connect` to join a channel.
    pub fn new(hub: BroadcastHub) -> Self {
        Self {
            hub,
            link: Mutex::new(None),
            shutdown: watch::channel(false).0,
        }
    }

    fn link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn connect(&self, channel: &str) -> Result<(), TransportError> {
        let tx = self.hub.sender(channel);
        let rx = tx.subscribe();
        *self.link() = Some(Link {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        });
        self.shutdown.send_replace(false);
        tracing::debug!(channel, "broadcast transport connected");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        check_size(data)?;
        let tx = match self.link().as_ref() {
            Some(link) => link.tx.clone(),
            None => return Err(TransportError::NotConnected),
        };
        // Our own receiver is subscribed, so this only fails once closed.
        tx.send(Arc::new(data.to_vec()))
            .map(|_| ())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let rx = match self.link().as_ref() {
            Some(link) => Arc::clone(&link.rx),
            None => return Err(TransportError::NotConnected),
        };
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = rx.lock().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Err(TransportError::ConnectionClosed),
                result = rx.recv() => match result {
                    Ok(data) => return Ok(data.as_ref().clone()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "broadcast receiver lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TransportError::ConnectionClosed)
                    }
                },
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link().is_some()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link().take();
        self.shutdown.send_replace(true);
        Ok(())
    }
}
