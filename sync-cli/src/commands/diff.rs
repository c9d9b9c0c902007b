//! Diff two documents.

use anyhow::Result;
use patchsync_core::{diff, diff_filtered};
use patchsync_types::{Operation, PointerPath};
use serde_json::Value;
use std::path::Path;

use super::{print_json, read_json};

/// Run the diff command.
pub async fn run(before: &Path, after: &Path, paths: &[String]) -> Result<()> {
    let before = read_json(before).await?;
    let after = read_json(after).await?;
    print_json(&operations(&before, &after, paths))
}

/// Operations turning `before` into `after`, limited to `paths` if any.
pub fn operations(before: &Value, after: &Value, paths: &[String]) -> Vec<Operation> {
    if paths.is_empty() {
        return diff(before, after);
    }
    let filter: Vec<PointerPath> = paths.iter().map(|p| PointerPath::from_dotted(p)).collect();
    diff_filtered(before, after, &filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_document() {
        let ops = operations(&json!({"a": 1, "b": 1}), &json!({"a": 2, "b": 1}), &[]);
        assert_eq!(
            ops,
            vec![Operation::replace("/a".parse().unwrap(), json!(2))]
        );
    }

    #[test]
    fn filtered_paths() {
        let before = json!({"user": {"name": "a"}, "noise": 1});
        let after = json!({"user": {"name": "b"}, "noise": 2});
        let ops = operations(&before, &after, &["user.name".to_string()]);
        assert_eq!(
            ops,
            vec![Operation::replace("/user/name".parse().unwrap(), json!("b"))]
        );
    }

    #[tokio::test]
    async fn run_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let before = dir.path().join("before.json");
        let after = dir.path().join("after.json");
        std::fs::write(&before, r#"{"n": 1}"#).unwrap();
        std::fs::write(&after, r#"{"n": 2}"#).unwrap();

        assert!(run(&before, &after, &[]).await.is_ok());
        assert!(run(&before, &dir.path().join("missing.json"), &[]).await.is_err());
    }
}
