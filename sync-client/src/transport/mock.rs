//! Mock transport for testing.
//!
//! Allows injecting inbound envelopes and capturing sent ones for
//! verification.

use super::{Transport, TransportError};
use async_trait::async_trait;
use patchsync_types::Envelope;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the coordinator
/// owns another. `recv()` waits until a message is queued or the transport
/// is closed.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    wake: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connected_channel: Option<String>,
    connect_attempts: u32,
    sent_messages: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
    offline: bool,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue raw bytes to be returned by `recv()`.
    pub fn queue_response(&self, data: Vec<u8>) {
        self.lock().receive_queue.push_back(data);
        self.wake.notify_one();
    }

    /// Queue an envelope to be returned by `recv()`.
    pub fn inject(&self, envelope: &Envelope) {
        if let Ok(bytes) = envelope.to_bytes() {
            self.queue_response(bytes);
        }
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.lock().sent_messages.clone()
    }

    /// Get all sent messages decoded as envelopes (undecodable ones skipped).
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent_messages()
            .iter()
            .filter_map(|bytes| Envelope::from_bytes(bytes).ok())
            .collect()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.lock().sent_messages.last().cloned()
    }

    /// Forget captured messages.
    pub fn clear_sent(&self) {
        self.lock().sent_messages.clear();
    }

    /// Get the channel that was joined.
    pub fn connected_channel(&self) -> Option<String> {
        self.lock().connected_channel.clone()
    }

    /// Number of `connect()` calls made.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.lock().fail_next_recv = Some(error.to_string());
        self.wake.notify_one();
    }

    /// Simulate losing the link: every connect() and send() fails until
    /// [`set_online`](Self::set_online) is called.
    pub fn set_offline(&self) {
        let mut inner = self.lock();
        inner.offline = true;
        inner.connected = false;
        drop(inner);
        self.wake.notify_one();
    }

    /// Restore the link after [`set_offline`](Self::set_offline).
    pub fn set_online(&self) {
        self.lock().offline = false;
    }

    /// Clear all state (messages, queue, connection).
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
        self.wake.notify_one();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, channel: &str) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.connect_attempts += 1;

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }
        if inner.offline {
            return Err(TransportError::ConnectionFailed("offline".into()));
        }

        inner.connected = true;
        inner.connected_channel = Some(channel.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            {
                let mut inner = self.lock();

                if !inner.connected {
                    return Err(TransportError::NotConnected);
                }

                // Check for forced failure
                if let Some(error) = inner.fail_next_recv.take() {
                    return Err(TransportError::ReceiveFailed(error));
                }

                if let Some(data) = inner.receive_queue.pop_front() {
                    return Ok(data);
                }
            }
            self.wake.notified().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().connected = false;
        self.wake.notify_one();
        Ok(())
    }
}
