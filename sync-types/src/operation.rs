//! Operations - single structural edits addressed by a JSON pointer.
//!
//! The JSON form follows RFC 6902 (`{"op": "replace", "path": "/name",
//! "value": "Jane"}`) so patches can be inspected and produced by other
//! tooling.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// One segment of a [`PointerPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Object member name (also `-`, the array append marker).
    Key(String),
    /// Array index.
    Index(usize),
}

impl Segment {
    fn parse(token: &str) -> Self {
        let numeric = !token.is_empty()
            && token.bytes().all(|b| b.is_ascii_digit())
            && (token == "0" || !token.starts_with('0'));
        match token.parse::<usize>() {
            Ok(index) if numeric => Segment::Index(index),
            _ => Segment::Key(token.to_string()),
        }
    }

    /// The segment as it appears in pointer text (unescaped).
    pub fn as_token(&self) -> String {
        match self {
            Segment::Key(key) => key.clone(),
            Segment::Index(index) => index.to_string(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(&key.replace('~', "~0").replace('/', "~1")),
            Segment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A location inside the watched document, as a sequence of segments.
///
/// Serialized as an RFC 6901 JSON pointer string. Purely numeric tokens
/// parse as [`Segment::Index`]; whether they address an array slot or an
/// object member is decided against the document at apply time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PointerPath(Vec<Segment>);

impl PointerPath {
    /// The document root (`""`).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// Parse a dotted path (`user.address.city`) into a pointer.
    ///
    /// Dotted paths are the form used by path filters. An empty string is
    /// the root.
    pub fn from_dotted(dotted: &str) -> Self {
        if dotted.is_empty() {
            return Self::root();
        }
        Self(dotted.split('.').map(Segment::parse).collect())
    }

    /// Segments of this path.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Whether this is the document root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the path has no segments (same as [`is_root`](Self::is_root)).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A new path with `segment` appended.
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// A new path with an object key appended.
    pub fn key(&self, key: impl Into<String>) -> Self {
        self.child(Segment::Key(key.into()))
    }

    /// A new path with an array index appended.
    pub fn index(&self, index: usize) -> Self {
        self.child(Segment::Index(index))
    }

    /// Split into parent path and last segment. `None` for the root.
    pub fn split_last(&self) -> Option<(PointerPath, &Segment)> {
        let (last, parent) = self.0.split_last()?;
        Some((PointerPath(parent.to_vec()), last))
    }

    /// Whether `self` equals `other` or is one of its ancestors.
    ///
    /// Comparison is by pointer text, so `Key("0")` and `Index(0)` match.
    pub fn is_prefix_of(&self, other: &PointerPath) -> bool {
        self.0.len() <= other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.as_token() == b.as_token())
    }

    /// Normalized pointer text, used as the identity of a path.
    pub fn normalized(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PointerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for PointerPath {
    type Err = SyncError;

    fn from_str(pointer: &str) -> Result<Self, Self::Err> {
        if pointer.is_empty() {
            return Ok(Self::root());
        }
        let rest = pointer
            .strip_prefix('/')
            .ok_or_else(|| SyncError::InvalidPointer(pointer.to_string()))?;
        let segments = rest
            .split('/')
            .map(|token| Segment::parse(&token.replace("~1", "/").replace("~0", "~")))
            .collect();
        Ok(Self(segments))
    }
}

impl TryFrom<String> for PointerPath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PointerPath> for String {
    fn from(path: PointerPath) -> Self {
        path.to_string()
    }
}

/// Kind of structural edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Insert a member or array element.
    Add,
    /// Remove a member or array element.
    Remove,
    /// Replace an existing value.
    Replace,
    /// Move a value from `from` to `path`.
    Move,
    /// Copy a value from `from` to `path`.
    Copy,
    /// Assert that the value at `path` equals `value`.
    Test,
}

impl OpKind {
    /// The RFC 6902 operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Remove => "remove",
            OpKind::Replace => "replace",
            OpKind::Move => "move",
            OpKind::Copy => "copy",
            OpKind::Test => "test",
        }
    }

    /// Whether operations of this kind must carry a `value`.
    pub fn needs_value(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Replace | OpKind::Test)
    }

    /// Whether operations of this kind must carry a `from` path.
    pub fn needs_from(&self) -> bool {
        matches!(self, OpKind::Move | OpKind::Copy)
    }
}

/// A single structural edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// What kind of edit this is.
    #[serde(rename = "op")]
    pub kind: OpKind,
    /// Target location.
    pub path: PointerPath,
    /// Value for add/replace/test. A present `null` is `Some(Value::Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub value: Option<Value>,
    /// Source location for move/copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PointerPath>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Operation {
    /// `add` at `path`.
    pub fn add(path: PointerPath, value: Value) -> Self {
        Self {
            kind: OpKind::Add,
            path,
            value: Some(value),
            from: None,
        }
    }

    /// `remove` at `path`.
    pub fn remove(path: PointerPath) -> Self {
        Self {
            kind: OpKind::Remove,
            path,
            value: None,
            from: None,
        }
    }

    /// `replace` at `path`.
    pub fn replace(path: PointerPath, value: Value) -> Self {
        Self {
            kind: OpKind::Replace,
            path,
            value: Some(value),
            from: None,
        }
    }

    /// `move` from `from` to `path`.
    pub fn move_to(from: PointerPath, path: PointerPath) -> Self {
        Self {
            kind: OpKind::Move,
            path,
            value: None,
            from: Some(from),
        }
    }

    /// `copy` from `from` to `path`.
    pub fn copy_to(from: PointerPath, path: PointerPath) -> Self {
        Self {
            kind: OpKind::Copy,
            path,
            value: None,
            from: Some(from),
        }
    }

    /// `test` that `path` holds `value`.
    pub fn test(path: PointerPath, value: Value) -> Self {
        Self {
            kind: OpKind::Test,
            path,
            value: Some(value),
            from: None,
        }
    }

    /// Every path this operation reads or writes (`path`, plus `from`).
    pub fn touched_paths(&self) -> impl Iterator<Item = &PointerPath> {
        std::iter::once(&self.path).chain(self.from.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ptr(s: &str) -> PointerPath {
        s.parse().unwrap()
    }

    #[test]
    fn pointer_parses_keys_and_indices() {
        let path = ptr("/list/0/name");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("list".into()),
                Segment::Index(0),
                Segment::Key("name".into())
            ]
        );
    }

    #[test]
    fn pointer_unescapes_tokens() {
        let path = ptr("/a~1b/c~0d");
        assert_eq!(
            path.segments(),
            &[Segment::Key("a/b".into()), Segment::Key("c~d".into())]
        );
        assert_eq!(path.to_string(), "/a~1b/c~0d");
    }

    #[test]
    fn pointer_keeps_leading_zero_tokens_as_keys() {
        assert_eq!(ptr("/007").segments(), &[Segment::Key("007".into())]);
    }

    #[test]
    fn pointer_without_leading_slash_fails() {
        assert!("name".parse::<PointerPath>().is_err());
    }

    #[test]
    fn empty_pointer_is_root() {
        assert!(ptr("").is_root());
        assert_eq!(PointerPath::root().to_string(), "");
    }

    #[test]
    fn dotted_path_converts_to_pointer() {
        assert_eq!(PointerPath::from_dotted("user.tags.1").to_string(), "/user/tags/1");
    }

    #[test]
    fn prefix_matches_by_token_text() {
        let parent = PointerPath::root().key("list");
        let child = ptr("/list/0");
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
        assert!(PointerPath::root().key("0").is_prefix_of(&ptr("/0")));
    }

    #[test]
    fn split_last_returns_parent() {
        let binding = ptr("/a/b");
        let (parent, last) = binding.split_last().unwrap();
        assert_eq!(parent, ptr("/a"));
        assert_eq!(last, &Segment::Key("b".into()));
        assert!(PointerPath::root().split_last().is_none());
    }

    #[test]
    fn operation_json_shape_matches_rfc6902() {
        let op = Operation::replace(ptr("/name"), json!("Jane"));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, json!({"op": "replace", "path": "/name", "value": "Jane"}));
    }

    #[test]
    fn explicit_null_value_is_preserved() {
        let op: Operation =
            serde_json::from_value(json!({"op": "replace", "path": "/x", "value": null})).unwrap();
        assert_eq!(op.value, Some(Value::Null));

        let op: Operation = serde_json::from_value(json!({"op": "remove", "path": "/x"})).unwrap();
        assert_eq!(op.value, None);
    }

    #[test]
    fn move_touches_both_paths() {
        let op = Operation::move_to(ptr("/a"), ptr("/b"));
        let touched: Vec<String> = op.touched_paths().map(|p| p.to_string()).collect();
        assert_eq!(touched, vec!["/b", "/a"]);
    }

    #[test]
    fn op_kind_requirements() {
        assert!(OpKind::Replace.needs_value());
        assert!(!OpKind::Remove.needs_value());
        assert!(OpKind::Copy.needs_from());
        assert_eq!(OpKind::Move.as_str(), "move");
    }
}
