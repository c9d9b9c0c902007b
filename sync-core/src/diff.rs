//! Diff engine: computes the operations that turn a baseline snapshot into
//! the current document.
//!
//! The engine owns a deep copy of the last document it saw. The first call
//! only records that baseline (cold start), so a replica that has just
//! started watching never broadcasts its whole state as a patch.
//!
//! With a path filter the engine inspects only the filtered subtrees and
//! emits one operation per changed subtree. Everything outside the filter is
//! never read, so the filter doubles as a scope boundary for what leaves the
//! replica.

use patchsync_types::{Operation, PointerPath};
use serde_json::{Map, Value};

use crate::apply::{apply_operations, get, StructuralError};

/// Outcome of a [`DiffEngine::generate`] call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiffResult {
    /// Operations turning the previous baseline into the current document.
    pub operations: Vec<Operation>,
    /// Whether any operation was produced.
    pub has_changes: bool,
}

impl DiffResult {
    fn from_operations(operations: Vec<Operation>) -> Self {
        let has_changes = !operations.is_empty();
        Self {
            operations,
            has_changes,
        }
    }
}

/// Stateful differ holding the previous snapshot.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    baseline: Option<Value>,
}

impl DiffEngine {
    /// Create an engine with no baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a baseline has been recorded.
    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    /// The current baseline, if any.
    pub fn baseline(&self) -> Option<&Value> {
        self.baseline.as_ref()
    }

    /// Compare `current` with the baseline, then make a deep copy of
    /// `current` the new baseline.
    ///
    /// Without a baseline nothing is reported. With `filter`, only the listed
    /// subtrees are compared.
    pub fn generate(&mut self, current: &Value, filter: Option<&[PointerPath]>) -> DiffResult {
        let result = match &self.baseline {
            None => DiffResult::default(),
            Some(previous) => DiffResult::from_operations(match filter {
                Some(paths) => diff_filtered(previous, current, paths),
                None => diff(previous, current),
            }),
        };
        self.baseline = Some(current.clone());
        result
    }

    /// Forget the baseline; the next [`generate`](Self::generate) is a cold start.
    pub fn reset(&mut self) {
        self.baseline = None;
    }

    /// Record `state` as the baseline without producing operations.
    pub fn set_initial_state(&mut self, state: Value) {
        self.baseline = Some(state);
    }

    /// Apply operations that were already applied to the live document
    /// (remote patches, explicit updates) to the baseline as well, so they
    /// are not reported again while other local changes still are.
    ///
    /// Without a baseline this is a no-op.
    pub fn absorb(&mut self, operations: &[Operation]) -> Result<(), StructuralError> {
        match self.baseline.as_mut() {
            Some(baseline) => apply_operations(baseline, operations),
            None => Ok(()),
        }
    }
}

/// Structural equality.
///
/// Numbers compare by numeric value, so `1` equals `1.0`. Everything else,
/// including date-like strings, compares by content. Reflexive and symmetric.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                x.as_f64() == y.as_f64()
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| deep_equal(a, b)))
        }
        _ => a == b,
    }
}

/// Full structural diff from `previous` to `current`.
pub fn diff(previous: &Value, current: &Value) -> Vec<Operation> {
    let mut ops = Vec::new();
    diff_at(&mut ops, &PointerPath::root(), previous, current);
    ops
}

/// Diff restricted to `paths`.
///
/// Each path is compared independently; a change anywhere below it yields a
/// single add/remove/replace for the path itself. A path nested under
/// another filtered path is covered by its ancestor and skipped.
pub fn diff_filtered(previous: &Value, current: &Value, paths: &[PointerPath]) -> Vec<Operation> {
    let mut ops = Vec::new();
    for (i, path) in paths.iter().enumerate() {
        let covered = paths
            .iter()
            .enumerate()
            .any(|(j, other)| j != i && other.is_prefix_of(path) && (other != path || j < i));
        if covered {
            continue;
        }
        match (get(previous, path), get(current, path)) {
            (None, None) => {}
            (None, Some(now)) => ops.push(Operation::add(path.clone(), now.clone())),
            (Some(_), None) => ops.push(Operation::remove(path.clone())),
            (Some(before), Some(now)) => {
                if !deep_equal(before, now) {
                    ops.push(Operation::replace(path.clone(), now.clone()));
                }
            }
        }
    }
    ops
}

fn diff_at(ops: &mut Vec<Operation>, path: &PointerPath, previous: &Value, current: &Value) {
    if deep_equal(previous, current) {
        return;
    }
    match (previous, current) {
        (Value::Object(before), Value::Object(after)) => diff_object(ops, path, before, after),
        (Value::Array(before), Value::Array(after)) => diff_array(ops, path, before, after),
        _ => ops.push(Operation::replace(path.clone(), current.clone())),
    }
}

fn diff_object(
    ops: &mut Vec<Operation>,
    path: &PointerPath,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
) {
    for key in before.keys() {
        if !after.contains_key(key) {
            ops.push(Operation::remove(path.key(key.as_str())));
        }
    }
    for (key, now) in after {
        let child = path.key(key.as_str());
        match before.get(key) {
            None => ops.push(Operation::add(child, now.clone())),
            Some(was) => diff_at(ops, &child, was, now),
        }
    }
}

fn diff_array(ops: &mut Vec<Operation>, path: &PointerPath, before: &[Value], after: &[Value]) {
    let common = before.len().min(after.len());
    for i in 0..common {
        diff_at(ops, &path.index(i), &before[i], &after[i]);
    }
    for (i, value) in after.iter().enumerate().skip(common) {
        ops.push(Operation::add(path.index(i), value.clone()));
    }
    // Remove from the end so earlier indices stay valid.
    for i in (common..before.len()).rev() {
        ops.push(Operation::remove(path.index(i)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_types::OpKind;
    use serde_json::json;

    fn ptr(s: &str) -> PointerPath {
        s.parse().unwrap()
    }

    fn roundtrips(before: Value, after: Value) {
        let ops = diff(&before, &after);
        let mut doc = before;
        apply_operations(&mut doc, &ops).unwrap();
        assert_eq!(doc, after);
    }

    #[test]
    fn equal_documents_produce_nothing() {
        assert!(diff(&json!({"a": [1, {"b": 2}]}), &json!({"a": [1, {"b": 2}]})).is_empty());
    }

    #[test]
    fn changed_member_is_replaced() {
        let ops = diff(&json!({"name": "John"}), &json!({"name": "Jane"}));
        assert_eq!(ops, vec![Operation::replace(ptr("/name"), json!("Jane"))]);
    }

    #[test]
    fn added_and_removed_members() {
        let ops = diff(&json!({"a": 1}), &json!({"b": 2}));
        assert_eq!(
            ops,
            vec![
                Operation::remove(ptr("/a")),
                Operation::add(ptr("/b"), json!(2))
            ]
        );
    }

    #[test]
    fn nested_change_is_addressed_precisely() {
        let ops = diff(
            &json!({"user": {"name": "a", "age": 1}}),
            &json!({"user": {"name": "a", "age": 2}}),
        );
        assert_eq!(ops, vec![Operation::replace(ptr("/user/age"), json!(2))]);
    }

    #[test]
    fn type_change_replaces_whole_value() {
        let ops = diff(&json!({"a": [1]}), &json!({"a": {"0": 1}}));
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::Replace);
    }

    #[test]
    fn array_growth_and_shrink_roundtrip() {
        roundtrips(json!({"l": [1, 2]}), json!({"l": [1, 5, 3, 4]}));
        roundtrips(json!({"l": [1, 2, 3, 4]}), json!({"l": [9]}));
        roundtrips(json!([{"a": 1}, {"a": 2}]), json!([{"a": 1}]));
    }

    #[test]
    fn array_shrink_removes_from_the_end() {
        let ops = diff(&json!([1, 2, 3]), &json!([1]));
        assert_eq!(
            ops,
            vec![Operation::remove(ptr("/2")), Operation::remove(ptr("/1"))]
        );
    }

    #[test]
    fn integer_and_float_of_same_value_are_equal() {
        assert!(deep_equal(&json!(1), &json!(1.0)));
        assert!(diff(&json!({"n": 1}), &json!({"n": 1.0})).is_empty());
    }

    #[test]
    fn deep_equal_is_reflexive_and_symmetric() {
        let samples = [
            json!(null),
            json!("2024-01-01T00:00:00Z"),
            json!({"a": [1, {"b": null}]}),
            json!([1, 2]),
            json!({"a": 1, "b": 2}),
        ];
        for a in &samples {
            assert!(deep_equal(a, a));
            for b in &samples {
                assert_eq!(deep_equal(a, b), deep_equal(b, a));
            }
        }
        assert!(!deep_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn first_generate_is_silent() {
        let mut engine = DiffEngine::new();
        let result = engine.generate(&json!({"name": "John"}), None);
        assert!(!result.has_changes);
        assert!(result.operations.is_empty());
        assert!(engine.has_baseline());
    }

    #[test]
    fn generate_reports_changes_since_last_call() {
        let mut engine = DiffEngine::new();
        engine.generate(&json!({"n": 1}), None);

        let result = engine.generate(&json!({"n": 2}), None);
        assert!(result.has_changes);
        assert_eq!(result.operations, vec![Operation::replace(ptr("/n"), json!(2))]);

        let result = engine.generate(&json!({"n": 2}), None);
        assert!(!result.has_changes);
    }

    #[test]
    fn baseline_does_not_alias_the_live_value() {
        let mut engine = DiffEngine::new();
        let mut live = json!({"n": 1});
        engine.generate(&live, None);

        live["n"] = json!(2);

        assert_eq!(engine.baseline(), Some(&json!({"n": 1})));
        assert!(engine.generate(&live, None).has_changes);
    }

    #[test]
    fn reset_returns_to_cold_start() {
        let mut engine = DiffEngine::new();
        engine.generate(&json!({"n": 1}), None);
        engine.reset();
        assert!(!engine.generate(&json!({"n": 2}), None).has_changes);
    }

    #[test]
    fn set_initial_state_forces_baseline() {
        let mut engine = DiffEngine::new();
        engine.set_initial_state(json!({"n": 1}));
        let result = engine.generate(&json!({"n": 3}), None);
        assert_eq!(result.operations, vec![Operation::replace(ptr("/n"), json!(3))]);
    }

    #[test]
    fn absorbed_operations_are_not_reported_again() {
        let mut engine = DiffEngine::new();
        engine.generate(&json!({"a": 1, "b": 1}), None);

        // A remote patch set `a`; the user changed `b` locally.
        let remote = [Operation::replace(ptr("/a"), json!(5))];
        engine.absorb(&remote).unwrap();

        let result = engine.generate(&json!({"a": 5, "b": 2}), None);
        assert_eq!(result.operations, vec![Operation::replace(ptr("/b"), json!(2))]);
    }

    #[test]
    fn absorb_without_baseline_is_noop() {
        let mut engine = DiffEngine::new();
        engine
            .absorb(&[Operation::remove(ptr("/missing"))])
            .unwrap();
        assert!(!engine.has_baseline());
    }

    #[test]
    fn filter_ignores_paths_outside_scope() {
        let before = json!({"user": {"name": "a"}, "secret": 1});
        let after = json!({"user": {"name": "a"}, "secret": 2});
        let filter = [PointerPath::from_dotted("user")];
        assert!(diff_filtered(&before, &after, &filter).is_empty());
    }

    #[test]
    fn filter_replaces_changed_subtree_at_absolute_path() {
        let before = json!({"user": {"profile": {"name": "a", "age": 1}}, "other": 1});
        let after = json!({"user": {"profile": {"name": "a", "age": 2}}, "other": 5});
        let filter = [PointerPath::from_dotted("user.profile")];

        let ops = diff_filtered(&before, &after, &filter);

        assert_eq!(
            ops,
            vec![Operation::replace(
                ptr("/user/profile"),
                json!({"name": "a", "age": 2})
            )]
        );
    }

    #[test]
    fn filter_emits_add_and_remove() {
        let filter = [PointerPath::from_dotted("a"), PointerPath::from_dotted("b")];
        let ops = diff_filtered(&json!({"a": 1}), &json!({"b": 2}), &filter);
        assert_eq!(
            ops,
            vec![
                Operation::remove(ptr("/a")),
                Operation::add(ptr("/b"), json!(2))
            ]
        );
    }

    #[test]
    fn nested_filters_do_not_duplicate() {
        let filter = [
            PointerPath::from_dotted("user.name"),
            PointerPath::from_dotted("user"),
            PointerPath::from_dotted("user"),
        ];
        let ops = diff_filtered(
            &json!({"user": {"name": "a"}}),
            &json!({"user": {"name": "b"}}),
            &filter,
        );
        assert_eq!(ops, vec![Operation::replace(ptr("/user"), json!({"name": "b"}))]);
    }

    #[test]
    fn generate_with_filter_still_rebaselines() {
        let mut engine = DiffEngine::new();
        let filter = [PointerPath::from_dotted("a")];
        engine.generate(&json!({"a": 1, "b": 1}), Some(&filter));
        engine.generate(&json!({"a": 1, "b": 2}), Some(&filter));

        let result = engine.generate(&json!({"a": 1, "b": 2}), None);
        assert!(!result.has_changes);
    }
}
