//! Storage-polling transport.
//!
//! The fallback strategy for contexts without a live channel: senders append
//! to a [`SharedLog`] and receivers poll it on an interval, tracking the last
//! sequence number they consumed. The log keeps a bounded tail; a receiver
//! that falls further behind than that skips the evicted entries.

use super::{check_size, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Default poll interval.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Entries retained by a [`SharedLog`].
const LOG_CAPACITY: usize = 512;

#[derive(Debug)]
struct LogEntry {
    seq: u64,
    channel: String,
    data: Arc<Vec<u8>>,
}

#[derive(Debug, Default)]
struct LogInner {
    next_seq: u64,
    entries: VecDeque<LogEntry>,
}

/// Append-only, bounded message log shared by storage transports.
#[derive(Debug, Clone, Default)]
pub struct SharedLog {
    inner: Arc<Mutex<LogInner>>,
}

impl SharedLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, channel: &str, data: &[u8]) -> u64 {
        let mut inner = self.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.entries.push_back(LogEntry {
            seq,
            channel: channel.to_string(),
            data: Arc::new(data.to_vec()),
        });
        while inner.entries.len() > LOG_CAPACITY {
            inner.entries.pop_front();
        }
        seq
    }

    /// Sequence number of the newest entry (0 when empty).
    pub fn head(&self) -> u64 {
        self.lock().next_seq
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn next_after(&self, channel: &str, after: u64) -> Option<(u64, Arc<Vec<u8>>)> {
        self.lock()
            .entries
            .iter()
            .find(|entry| entry.seq > after && entry.channel == channel)
            .map(|entry| (entry.seq, Arc::clone(&entry.data)))
    }
}

#[derive(Debug)]
struct Cursor {
    channel: String,
    last_seen: u64,
}

/// Transport that polls a [`SharedLog`].
#[derive(Debug)]
pub struct StorageTransport {
    log: SharedLog,
    poll_interval: Duration,
    cursor: Mutex<Option<Cursor>>,
    shutdown: watch::Sender<bool>,
}

impl StorageTransport {
    /// Create a transport on `log`. Call `connect` to join a channel.
    pub fn new(log: SharedLog) -> Self {
        Self {
            log,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cursor: Mutex::new(None),
            shutdown: watch::channel(false).0,
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, Option<Cursor>> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the next entry past the cursor, advancing it.
    fn poll_once(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut guard = self.cursor();
        let cursor = guard.as_mut().ok_or(TransportError::NotConnected)?;
        match self.log.next_after(&cursor.channel, cursor.last_seen) {
            Some((seq, data)) => {
                cursor.last_seen = seq;
                Ok(Some(data.as_ref().clone()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for StorageTransport {
    async fn connect(&self, channel: &str) -> Result<(), TransportError> {
        // Only messages written after joining are delivered.
        *self.cursor() = Some(Cursor {
            channel: channel.to_string(),
            last_seen: self.log.head(),
        });
        self.shutdown.send_replace(false);
        tracing::debug!(channel, "storage transport connected");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        check_size(data)?;
        let channel = match self.cursor().as_ref() {
            Some(cursor) => cursor.channel.clone(),
            None => return Err(TransportError::NotConnected),
        };
        self.log.append(&channel, data);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return Err(TransportError::ConnectionClosed);
            }
            if let Some(data) = self.poll_once()? {
                return Ok(data);
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.cursor().is_some()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cursor().take();
        self.shutdown.send_replace(true);
        Ok(())
    }
}
