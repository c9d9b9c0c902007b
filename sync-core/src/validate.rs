//! Structural validation of patches.
//!
//! Validation reports every violation it finds instead of failing on the
//! first, so callers can choose between dropping and quarantining a patch.

use patchsync_types::Patch;
use serde_json::Value;
use std::fmt;

/// One structural problem with a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Offending field (`id`, `operations[2].value`, ...).
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a typed patch for well-formedness.
pub fn validate(patch: &Patch) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if patch.id.is_empty() {
        issues.push(ValidationIssue::new("id", "must not be empty"));
    }
    if patch.target.is_empty() {
        issues.push(ValidationIssue::new("target", "must not be empty"));
    }
    if patch.version == 0 {
        issues.push(ValidationIssue::new("version", "must be at least 1"));
    }
    if patch.operations.is_empty() {
        issues.push(ValidationIssue::new("operations", "must not be empty"));
    }
    for (i, op) in patch.operations.iter().enumerate() {
        if op.kind.needs_value() && op.value.is_none() {
            issues.push(ValidationIssue::new(
                format!("operations[{i}].value"),
                format!("required for {}", op.kind.as_str()),
            ));
        }
        if op.kind.needs_from() && op.from.is_none() {
            issues.push(ValidationIssue::new(
                format!("operations[{i}].from"),
                format!("required for {}", op.kind.as_str()),
            ));
        }
    }
    issues
}

/// Check an untyped payload (as received off the wire) for well-formedness.
///
/// Reports shape problems that would stop the payload from decoding as a
/// patch. When the shape is sound the typed checks of [`validate`] run too.
pub fn validate_json(value: &Value) -> Vec<ValidationIssue> {
    let Some(obj) = value.as_object() else {
        return vec![ValidationIssue::new("patch", "must be an object")];
    };

    let mut issues = Vec::new();
    for field in ["id", "source", "target"] {
        match obj.get(field).and_then(Value::as_str) {
            Some(s) if !s.is_empty() => {}
            Some(_) => issues.push(ValidationIssue::new(field, "must not be empty")),
            None => issues.push(ValidationIssue::new(field, "must be a string")),
        }
    }
    for field in ["timestamp", "version"] {
        if !obj.get(field).is_some_and(Value::is_number) {
            issues.push(ValidationIssue::new(field, "must be a number"));
        }
    }
    match obj.get("operations").and_then(Value::as_array) {
        None => issues.push(ValidationIssue::new("operations", "must be an array")),
        Some(ops) => {
            for (i, op) in ops.iter().enumerate() {
                let has_kind = op.get("op").is_some_and(Value::is_string);
                let has_path = op.get("path").is_some_and(Value::is_string);
                if !has_kind || !has_path {
                    issues.push(ValidationIssue::new(
                        format!("operations[{i}]"),
                        "must have string `op` and `path`",
                    ));
                }
            }
        }
    }

    if issues.is_empty() {
        match serde_json::from_value::<Patch>(value.clone()) {
            Ok(patch) => issues.extend(validate(&patch)),
            Err(e) => issues.push(ValidationIssue::new("patch", e.to_string())),
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_types::{InstanceId, OpKind, Operation, PatchId, SourceId};
    use serde_json::json;

    fn good_patch() -> Patch {
        Patch::new(
            SourceId::random(),
            InstanceId::new("doc"),
            vec![Operation::replace("/a".parse().unwrap(), json!(1))],
            1,
        )
    }

    #[test]
    fn well_formed_patch_has_no_issues() {
        assert!(validate(&good_patch()).is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let mut patch = good_patch();
        patch.id = PatchId::from_string("");
        patch.target = InstanceId::new("");
        patch.version = 0;
        patch.operations = vec![];

        let fields: Vec<String> = validate(&patch).into_iter().map(|i| i.field).collect();
        assert_eq!(fields, vec!["id", "target", "version", "operations"]);
    }

    #[test]
    fn operations_missing_payload_are_reported() {
        let mut patch = good_patch();
        patch.operations = vec![
            Operation {
                kind: OpKind::Add,
                path: "/a".parse().unwrap(),
                value: None,
                from: None,
            },
            Operation {
                kind: OpKind::Move,
                path: "/b".parse().unwrap(),
                value: None,
                from: None,
            },
        ];

        let issues = validate(&patch);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].field, "operations[0].value");
        assert_eq!(issues[1].field, "operations[1].from");
    }

    #[test]
    fn json_validation_reports_shape_problems() {
        let issues = validate_json(&json!({
            "id": "",
            "timestamp": "yesterday",
            "target": "doc",
            "operations": {},
            "version": 1
        }));
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "source", "timestamp", "operations"]);
    }

    #[test]
    fn json_validation_accepts_serialized_patch() {
        let value = serde_json::to_value(good_patch()).unwrap();
        assert!(validate_json(&value).is_empty());
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert_eq!(validate_json(&json!([1])).len(), 1);
    }

    #[test]
    fn issue_display() {
        let issue = ValidationIssue::new("id", "must not be empty");
        assert_eq!(issue.to_string(), "id: must not be empty");
    }
}
