//! Identity types for patchsync.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Identity of a running replica.
///
/// 16 bytes of random data, displayed as URL-safe base64. Generated once per
/// coordinator and used to drop self-originated patches and to attribute
/// authorship during conflict resolution.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId([u8; 16]);

impl SourceId {
    /// Create a new random SourceId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a SourceId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 16 {
            let mut arr = [0u8; 16];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this SourceId.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", &self.to_string()[..8])
    }
}

impl FromStr for SourceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| SyncError::InvalidData(format!("source id: {e}")))?;
        Self::from_bytes(&bytes)
            .ok_or_else(|| SyncError::InvalidData(format!("source id length {}", bytes.len())))
    }
}

impl TryFrom<String> for SourceId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.to_string()
    }
}

/// Identity of the replicated object (the configured `id`).
///
/// Every replica of the same object shares one InstanceId; it is stamped as
/// the patch target and namespaces the offline queue.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create an InstanceId from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (never valid on the wire).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Globally unique patch identifier.
///
/// Freshly generated patches carry a UUID v4. Patches synthesized by conflict
/// resolution carry an id derived from both inputs, so the text form is kept
/// rather than a parsed UUID.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchId(String);

impl PatchId {
    /// Create a new random PatchId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Id of a patch synthesized from `local` and `incoming`.
    pub fn resolved(local: &PatchId, incoming: &PatchId) -> Self {
        Self(format!("{}-{}-resolved", local.0, incoming.0))
    }

    /// Wrap an existing identifier.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (never valid on the wire).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for PatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatchId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_roundtrip() {
        let original = SourceId::random();
        let restored = SourceId::from_bytes(original.as_bytes()).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn source_id_base64_display() {
        let id = SourceId::random();
        assert_eq!(id.to_string().len(), 22); // 16 bytes = 22 base64 chars (no padding)
    }

    #[test]
    fn source_id_parses_its_display_form() {
        let id = SourceId::random();
        let parsed: SourceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn source_id_serializes_as_string() {
        let id = SourceId::random();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }

    #[test]
    fn source_id_from_invalid_length_fails() {
        assert!(SourceId::from_bytes(&[0u8; 8]).is_none());
        assert!("AAAA".parse::<SourceId>().is_err());
    }

    #[test]
    fn random_source_ids_differ() {
        assert_ne!(SourceId::random(), SourceId::random());
    }

    #[test]
    fn patch_id_is_uuid_v4() {
        let id = PatchId::new();
        let uuid = uuid::Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn resolved_patch_id_names_both_inputs() {
        let a = PatchId::from_string("a");
        let b = PatchId::from_string("b");
        assert_eq!(PatchId::resolved(&a, &b).as_str(), "a-b-resolved");
    }

    #[test]
    fn instance_id_is_transparent() {
        let id = InstanceId::new("doc-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"doc-1\"");
    }
}
