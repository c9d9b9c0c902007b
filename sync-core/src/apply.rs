//! Operation application.
//!
//! Applies RFC 6902 operations to a JSON document. Application of an
//! operation set is all-or-nothing: [`apply_operations`] works on a scratch
//! copy and only replaces the caller's document once every operation has
//! succeeded, so a failing set never leaves a partially-applied document.

use patchsync_types::{OpKind, Operation, PointerPath, Segment};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a single operation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// Nothing exists at the path (or its parent).
    #[error("path not found: {0}")]
    NotFound(String),

    /// Array index is not a number or is out of bounds.
    #[error("invalid array index at {0}")]
    InvalidIndex(String),

    /// The parent at the path is not a container.
    #[error("cannot address into a scalar at {0}")]
    InvalidTarget(String),

    /// A `test` operation did not match.
    #[error("test failed at {0}")]
    TestFailed(String),

    /// An add/replace/test operation has no value.
    #[error("operation at {0} is missing its value")]
    MissingValue(String),

    /// A move/copy operation has no `from` path.
    #[error("operation at {0} is missing its from path")]
    MissingFrom(String),

    /// A value cannot be moved into one of its own descendants.
    #[error("cannot move {from} into its descendant {path}")]
    MoveIntoDescendant {
        /// Source path.
        from: String,
        /// Destination path.
        path: String,
    },
}

/// A rejected operation set: which operation failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation {index} ({}) rejected: {reason}", .kind.as_str())]
pub struct StructuralError {
    /// Position of the failing operation in the set.
    pub index: usize,
    /// Kind of the failing operation.
    pub kind: OpKind,
    /// Underlying failure.
    #[source]
    pub reason: PatchError,
}

/// Resolve `path` against `doc`.
pub fn get<'a>(doc: &'a Value, path: &PointerPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(doc, |node, segment| child(node, segment))
}

fn child<'a>(node: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(&segment.as_token()),
        Value::Array(items) => array_index(segment).and_then(|i| items.get(i)),
        _ => None,
    }
}

fn get_mut<'a>(doc: &'a mut Value, path: &PointerPath) -> Result<&'a mut Value, PatchError> {
    let mut node = doc;
    for segment in path.segments() {
        node = match node {
            Value::Object(map) => map
                .get_mut(&segment.as_token())
                .ok_or_else(|| PatchError::NotFound(path.to_string()))?,
            Value::Array(items) => {
                let index =
                    array_index(segment).ok_or_else(|| PatchError::InvalidIndex(path.to_string()))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::NotFound(path.to_string()))?
            }
            _ => return Err(PatchError::InvalidTarget(path.to_string())),
        };
    }
    Ok(node)
}

fn array_index(segment: &Segment) -> Option<usize> {
    match segment {
        Segment::Index(i) => Some(*i),
        Segment::Key(key) => key.parse().ok(),
    }
}

fn add(doc: &mut Value, path: &PointerPath, value: Value) -> Result<(), PatchError> {
    let Some((parent_path, last)) = path.split_last() else {
        *doc = value;
        return Ok(());
    };
    match get_mut(doc, &parent_path)? {
        Value::Object(map) => {
            map.insert(last.as_token(), value);
            Ok(())
        }
        Value::Array(items) => {
            if matches!(last, Segment::Key(k) if k == "-") {
                items.push(value);
                return Ok(());
            }
            let index = array_index(last).ok_or_else(|| PatchError::InvalidIndex(path.to_string()))?;
            if index > items.len() {
                return Err(PatchError::InvalidIndex(path.to_string()));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::InvalidTarget(path.to_string())),
    }
}

fn remove(doc: &mut Value, path: &PointerPath) -> Result<Value, PatchError> {
    let (parent_path, last) = path
        .split_last()
        .ok_or_else(|| PatchError::InvalidTarget(path.to_string()))?;
    match get_mut(doc, &parent_path)? {
        Value::Object(map) => map
            .remove(&last.as_token())
            .ok_or_else(|| PatchError::NotFound(path.to_string())),
        Value::Array(items) => {
            let index = array_index(last).ok_or_else(|| PatchError::InvalidIndex(path.to_string()))?;
            if index >= items.len() {
                return Err(PatchError::NotFound(path.to_string()));
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::InvalidTarget(path.to_string())),
    }
}

fn replace(doc: &mut Value, path: &PointerPath, value: Value) -> Result<(), PatchError> {
    let target = get_mut(doc, path)?;
    *target = value;
    Ok(())
}

/// Apply a single operation in place.
///
/// On failure `doc` may be partially modified (a failed `move` can have
/// removed its source); use [`apply_operations`] for all-or-nothing
/// semantics.
pub fn apply_operation(doc: &mut Value, op: &Operation) -> Result<(), PatchError> {
    let value = || {
        op.value
            .clone()
            .ok_or_else(|| PatchError::MissingValue(op.path.to_string()))
    };
    let from = || {
        op.from
            .as_ref()
            .ok_or_else(|| PatchError::MissingFrom(op.path.to_string()))
    };

    match op.kind {
        OpKind::Add => add(doc, &op.path, value()?),
        OpKind::Remove => remove(doc, &op.path).map(|_| ()),
        OpKind::Replace => replace(doc, &op.path, value()?),
        OpKind::Copy => {
            let from = from()?;
            let copied = get(doc, from)
                .cloned()
                .ok_or_else(|| PatchError::NotFound(from.to_string()))?;
            add(doc, &op.path, copied)
        }
        OpKind::Move => {
            let from = from()?;
            if from == &op.path {
                return get(doc, from)
                    .map(|_| ())
                    .ok_or_else(|| PatchError::NotFound(from.to_string()));
            }
            if from.is_prefix_of(&op.path) {
                return Err(PatchError::MoveIntoDescendant {
                    from: from.to_string(),
                    path: op.path.to_string(),
                });
            }
            let moved = remove(doc, from)?;
            add(doc, &op.path, moved)
        }
        OpKind::Test => {
            let expected = value()?;
            match get(doc, &op.path) {
                Some(actual) if crate::deep_equal(actual, &expected) => Ok(()),
                Some(_) => Err(PatchError::TestFailed(op.path.to_string())),
                None => Err(PatchError::NotFound(op.path.to_string())),
            }
        }
    }
}

/// Apply an operation set as a unit.
///
/// Every operation is evaluated against a scratch copy of `doc`; `doc` is
/// only replaced once the whole set succeeds.
pub fn apply_operations(doc: &mut Value, ops: &[Operation]) -> Result<(), StructuralError> {
    let mut scratch = doc.clone();
    for (index, op) in ops.iter().enumerate() {
        apply_operation(&mut scratch, op).map_err(|reason| StructuralError {
            index,
            kind: op.kind,
            reason,
        })?;
    }
    *doc = scratch;
    Ok(())
}

/// Write `value` at `path`, creating missing parent objects on the way.
///
/// An array parent accepts an existing index or one past its end.
pub fn graft(doc: &mut Value, path: &PointerPath, value: Value) -> Result<(), PatchError> {
    let mut node = doc;
    for segment in path.segments() {
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map.entry(segment.as_token()).or_insert(Value::Null),
            Value::Array(items) => {
                let index =
                    array_index(segment).ok_or_else(|| PatchError::InvalidIndex(path.to_string()))?;
                if index == items.len() {
                    items.push(Value::Null);
                }
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::InvalidIndex(path.to_string()))?
            }
            _ => return Err(PatchError::InvalidTarget(path.to_string())),
        };
    }
    *node = value;
    Ok(())
}

/// Copy of the subtrees of `doc` at `paths`, each at its own location.
///
/// Paths that do not resolve in `doc` are left out.
pub fn project(doc: &Value, paths: &[PointerPath]) -> Value {
    let mut out = Value::Object(Map::new());
    for path in paths {
        if let Some(value) = get(doc, path) {
            // `out` only holds containers copied from `doc`, so this cannot hit a scalar.
            let _ = graft(&mut out, path, value.clone());
        }
    }
    out
}
