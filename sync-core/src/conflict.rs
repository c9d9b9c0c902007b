//! Conflict detection and resolution between a locally pending patch and an
//! incoming remote patch.
//!
//! Resolution is total: every call yields a patch. A custom resolver that
//! fails or panics is replaced by last-write-wins and the failure is handed
//! back next to the result for reporting.

use patchsync_types::{Operation, Patch, PatchId, PointerPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

use crate::validate::{validate, ValidationIssue};

/// How touched paths are compared when detecting a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictDetection {
    /// Paths conflict only when they are identical.
    #[default]
    ExactPath,
    /// Paths also conflict when one is an ancestor of the other
    /// (`/list` and `/list/0`).
    Overlapping,
}

impl ConflictDetection {
    /// Whether two touched paths conflict under this rule.
    pub fn paths_conflict(&self, a: &PointerPath, b: &PointerPath) -> bool {
        match self {
            ConflictDetection::ExactPath => a.normalized() == b.normalized(),
            ConflictDetection::Overlapping => a.is_prefix_of(b) || b.is_prefix_of(a),
        }
    }
}

/// Built-in resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The later timestamp wins wholesale; ties favor local.
    #[default]
    LastWriteWins,
    /// Local operations followed by incoming operations.
    Merge,
    /// Union of operations; on conflicting paths the later patch wins.
    PathBased,
}

impl ConflictPolicy {
    /// Name recorded in `metadata.resolution`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriteWins => "last-write-wins",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::PathBased => "path-based",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-write-wins" | "lww" => Ok(ConflictPolicy::LastWriteWins),
            "merge" => Ok(ConflictPolicy::Merge),
            "path-based" => Ok(ConflictPolicy::PathBased),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Error returned by a custom resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ResolverError(pub String);

impl ResolverError {
    /// Create a resolver error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A custom resolver failure that was replaced by last-write-wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverFailure {
    /// The resolver returned an error.
    #[error("conflict resolver {resolver} failed: {source}")]
    Failed {
        /// Resolver name.
        resolver: String,
        /// Error it returned.
        #[source]
        source: ResolverError,
    },
    /// The resolver panicked.
    #[error("conflict resolver {resolver} panicked: {message}")]
    Panicked {
        /// Resolver name.
        resolver: String,
        /// Panic payload, when it was a string.
        message: String,
    },
}

/// User-supplied resolution strategy.
///
/// The returned patch keeps its operations, timestamp and source; the engine
/// stamps the derived id, version and resolution metadata on it.
pub trait ConflictResolver: Send + Sync {
    /// Produce a single patch from two conflicting ones.
    fn resolve(&self, local: &Patch, incoming: &Patch) -> Result<Patch, ResolverError>;

    /// Name recorded in `metadata.resolution`.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Result of [`ConflictEngine::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The resolved patch.
    pub patch: Patch,
    /// Set when a custom resolver failed and last-write-wins was used.
    pub fallback: Option<ResolverFailure>,
}

/// Detects and resolves conflicts between patches.
#[derive(Clone, Default)]
pub struct ConflictEngine {
    detection: ConflictDetection,
    policy: ConflictPolicy,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl fmt::Debug for ConflictEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictEngine")
            .field("detection", &self.detection)
            .field("policy", &self.policy)
            .field("resolver", &self.resolver.as_ref().map(|r| r.name().to_string()))
            .finish()
    }
}

impl ConflictEngine {
    /// Engine with exact-path detection and last-write-wins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the detection rule.
    pub fn with_detection(mut self, detection: ConflictDetection) -> Self {
        self.detection = detection;
        self
    }

    /// Set the default policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Install a custom resolver. It is used whenever no policy is passed
    /// explicitly to [`resolve`](Self::resolve).
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The detection rule in use.
    pub fn detection(&self) -> ConflictDetection {
        self.detection
    }

    /// The default policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Whether the two patches touch a common path.
    pub fn has_conflict(&self, a: &Patch, b: &Patch) -> bool {
        a.operations
            .iter()
            .any(|op| self.op_conflicts_with(op, &b.operations))
    }

    /// Paths of `a` that conflict with some path of `b`, deduplicated.
    pub fn conflicting_paths(&self, a: &Patch, b: &Patch) -> Vec<PointerPath> {
        let mut paths: Vec<PointerPath> = Vec::new();
        for path in a.operations.iter().flat_map(Operation::touched_paths) {
            let hit = b
                .operations
                .iter()
                .flat_map(Operation::touched_paths)
                .any(|other| self.detection.paths_conflict(path, other));
            if hit && !paths.iter().any(|p| p.normalized() == path.normalized()) {
                paths.push(path.clone());
            }
        }
        paths
    }

    /// Resolve `local` against `incoming`.
    ///
    /// An explicit `policy` overrides both the configured policy and any
    /// custom resolver. Inputs are never modified.
    pub fn resolve(
        &self,
        local: &Patch,
        incoming: &Patch,
        policy: Option<ConflictPolicy>,
    ) -> Resolution {
        if let (None, Some(resolver)) = (policy, &self.resolver) {
            return match run_resolver(resolver.as_ref(), local, incoming) {
                Ok(custom) => Resolution {
                    patch: finish(custom, local, incoming, resolver.name()),
                    fallback: None,
                },
                Err(failure) => Resolution {
                    patch: self.last_write_wins(local, incoming),
                    fallback: Some(failure),
                },
            };
        }

        let patch = match policy.unwrap_or(self.policy) {
            ConflictPolicy::LastWriteWins => self.last_write_wins(local, incoming),
            ConflictPolicy::Merge => self.merge(local, incoming),
            ConflictPolicy::PathBased => self.path_based(local, incoming),
        };
        Resolution {
            patch,
            fallback: None,
        }
    }

    /// Structural check of a patch; see [`crate::validate`].
    pub fn validate(&self, patch: &Patch) -> Vec<ValidationIssue> {
        validate(patch)
    }

    fn op_conflicts_with(&self, op: &Operation, others: &[Operation]) -> bool {
        op.touched_paths().any(|path| {
            others
                .iter()
                .flat_map(Operation::touched_paths)
                .any(|other| self.detection.paths_conflict(path, other))
        })
    }

    fn last_write_wins(&self, local: &Patch, incoming: &Patch) -> Patch {
        let winner = if incoming.timestamp > local.timestamp {
            incoming
        } else {
            local
        };
        finish(
            winner.clone(),
            local,
            incoming,
            ConflictPolicy::LastWriteWins.as_str(),
        )
    }

    fn merge(&self, local: &Patch, incoming: &Patch) -> Patch {
        let mut merged = local.clone();
        merged.operations.extend(incoming.operations.iter().cloned());
        merged.timestamp = local.timestamp.max(incoming.timestamp);
        merged.metadata.insert("merged".into(), Value::Bool(true));
        finish(merged, local, incoming, ConflictPolicy::Merge.as_str())
    }

    fn path_based(&self, local: &Patch, incoming: &Patch) -> Patch {
        let incoming_later = incoming.timestamp > local.timestamp;

        let mut operations: Vec<Operation> = local
            .operations
            .iter()
            .filter(|op| !incoming_later || !self.op_conflicts_with(op, &incoming.operations))
            .cloned()
            .collect();
        for op in &incoming.operations {
            let keep = incoming_later || !self.op_conflicts_with(op, &local.operations);
            if keep && !operations.contains(op) {
                operations.push(op.clone());
            }
        }

        let mut combined = local.clone();
        combined.operations = operations;
        combined.timestamp = local.timestamp.max(incoming.timestamp);
        finish(combined, local, incoming, ConflictPolicy::PathBased.as_str())
    }
}

/// Stamp the derived identity on a resolved patch.
fn finish(mut patch: Patch, local: &Patch, incoming: &Patch, resolution: &str) -> Patch {
    patch.id = PatchId::resolved(&local.id, &incoming.id);
    patch.version = local.version.max(incoming.version) + 1;
    patch
        .metadata
        .insert("resolution".into(), Value::String(resolution.to_string()));
    patch
}

fn run_resolver(
    resolver: &dyn ConflictResolver,
    local: &Patch,
    incoming: &Patch,
) -> Result<Patch, ResolverFailure> {
    match panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(local, incoming))) {
        Ok(Ok(patch)) => Ok(patch),
        Ok(Err(source)) => Err(ResolverFailure::Failed {
            resolver: resolver.name().to_string(),
            source,
        }),
        Err(payload) => Err(ResolverFailure::Panicked {
            resolver: resolver.name().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
