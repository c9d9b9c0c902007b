//! Envelope - the wire format wrapper for all messages exchanged by peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{now_millis, Patch, SourceId, SyncError};

/// Message type discriminator for envelope routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A patch to reconcile and apply
    Patch,
    /// Full-state snapshot request (null data) or response
    Sync,
    /// Liveness probe
    Ping,
    /// Reply to a liveness probe
    Pong,
}

impl EnvelopeKind {
    /// Lowercase name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Patch => "patch",
            EnvelopeKind::Sync => "sync",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
        }
    }
}

/// Full-state payload carried by a `Sync` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The responder's current document.
    pub state: Value,
    /// The responder's latest local version.
    pub version: u64,
}

/// The envelope wraps every message with routing metadata.
///
/// This is what transports carry. `data` is the kind-specific payload: a
/// serialized [`Patch`], a [`StateSnapshot`], or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Kind-specific payload
    #[serde(default)]
    pub data: Value,
    /// Sender's replica id
    pub source: SourceId,
    /// Wall-clock milliseconds at send time - informational only
    pub timestamp: i64,
}

impl Envelope {
    /// Create a new envelope for sending.
    pub fn new(kind: EnvelopeKind, source: SourceId, data: Value) -> Self {
        Self {
            kind,
            data,
            source,
            timestamp: now_millis(),
        }
    }

    /// Wrap a patch. The envelope source is the patch source.
    pub fn patch(patch: &Patch) -> Result<Self, SyncError> {
        Ok(Self::new(
            EnvelopeKind::Patch,
            patch.source,
            serde_json::to_value(patch)?,
        ))
    }

    /// Liveness probe.
    pub fn ping(source: SourceId) -> Self {
        Self::new(EnvelopeKind::Ping, source, Value::Null)
    }

    /// Reply to a liveness probe.
    pub fn pong(source: SourceId) -> Self {
        Self::new(EnvelopeKind::Pong, source, Value::Null)
    }

    /// Ask peers for their full state.
    pub fn sync_request(source: SourceId) -> Self {
        Self::new(EnvelopeKind::Sync, source, Value::Null)
    }

    /// Answer a snapshot request.
    pub fn sync_response(source: SourceId, snapshot: &StateSnapshot) -> Result<Self, SyncError> {
        Ok(Self::new(
            EnvelopeKind::Sync,
            source,
            serde_json::to_value(snapshot)?,
        ))
    }

    /// Decode the patch payload.
    pub fn to_patch(&self) -> Result<Patch, SyncError> {
        self.expect_kind(EnvelopeKind::Patch)?;
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Decode a snapshot payload. `Ok(None)` for a snapshot request.
    pub fn to_snapshot(&self) -> Result<Option<StateSnapshot>, SyncError> {
        self.expect_kind(EnvelopeKind::Sync)?;
        if self.data.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(self.data.clone())?))
    }

    fn expect_kind(&self, expected: EnvelopeKind) -> Result<(), SyncError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(SyncError::UnexpectedKind {
                expected: expected.as_str(),
                actual: self.kind.as_str(),
            })
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceId, Operation};
    use serde_json::json;

    fn sample_patch() -> Patch {
        Patch::new(
            SourceId::random(),
            InstanceId::new("doc"),
            vec![Operation::replace("/name".parse().unwrap(), json!("Jane"))],
            3,
        )
    }

    #[test]
    fn patch_envelope_survives_msgpack() {
        let patch = sample_patch();
        let envelope = Envelope::patch(&patch).unwrap();

        let bytes = envelope.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(restored.kind, EnvelopeKind::Patch);
        assert_eq!(restored.source, patch.source);
        assert_eq!(restored.to_patch().unwrap(), patch);
    }

    #[test]
    fn envelope_json_uses_type_field() {
        let envelope = Envelope::ping(SourceId::random());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "ping");
    }

    #[test]
    fn sync_request_has_no_snapshot() {
        let envelope = Envelope::sync_request(SourceId::random());
        assert!(envelope.to_snapshot().unwrap().is_none());
    }

    #[test]
    fn sync_response_carries_snapshot() {
        let snapshot = StateSnapshot {
            state: json!({"a": 1}),
            version: 7,
        };
        let envelope = Envelope::sync_response(SourceId::random(), &snapshot).unwrap();
        assert_eq!(envelope.to_snapshot().unwrap(), Some(snapshot));
    }

    #[test]
    fn decoding_wrong_kind_fails() {
        let envelope = Envelope::pong(SourceId::random());
        assert!(matches!(
            envelope.to_patch(),
            Err(SyncError::UnexpectedKind {
                expected: "patch",
                actual: "pong"
            })
        ));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(Envelope::from_bytes(&[0xc1, 0x00]).is_err());
    }

    #[test]
    fn envelope_new_sets_timestamp() {
        let envelope = Envelope::ping(SourceId::random());
        let now = now_millis();
        assert!(envelope.timestamp <= now);
        assert!(envelope.timestamp >= now - 60_000);
    }
}
