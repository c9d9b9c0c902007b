//! Error types for patchsync.

use thiserror::Error;

/// Errors that can occur while encoding or decoding patchsync types.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON conversion of an envelope payload failed
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A JSON pointer string could not be parsed
    #[error("invalid pointer: {0:?}")]
    InvalidPointer(String),

    /// Envelope carried a different kind than the caller asked for
    #[error("unexpected envelope kind: expected {expected}, got {actual}")]
    UnexpectedKind {
        /// Kind the caller expected.
        expected: &'static str,
        /// Kind found on the envelope.
        actual: &'static str,
    },

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidPointer("name".into());
        assert_eq!(err.to_string(), "invalid pointer: \"name\"");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
