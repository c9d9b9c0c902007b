//! Resolve two conflicting patches.

use anyhow::Result;
use clap::ValueEnum;
use patchsync_core::{ConflictDetection, ConflictEngine, ConflictPolicy};
use patchsync_types::Patch;
use std::path::Path;

use super::{print_json, read_patch};

/// Conflict detection rule as a CLI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Detection {
    /// Paths conflict only when equal
    Exact,
    /// Paths conflict when one contains the other
    Overlapping,
}

impl From<Detection> for ConflictDetection {
    fn from(detection: Detection) -> Self {
        match detection {
            Detection::Exact => ConflictDetection::ExactPath,
            Detection::Overlapping => ConflictDetection::Overlapping,
        }
    }
}

/// Run the resolve command.
pub async fn run(
    local: &Path,
    incoming: &Path,
    policy: ConflictPolicy,
    detection: Detection,
) -> Result<()> {
    let local = read_patch(local).await?;
    let incoming = read_patch(incoming).await?;
    let engine = ConflictEngine::new()
        .with_detection(detection.into())
        .with_policy(policy);

    if !engine.has_conflict(&local, &incoming) {
        eprintln!("No conflicting paths; patches apply independently.");
    }
    print_json(&resolve(&engine, &local, &incoming))
}

/// Resolve with the engine's policy.
pub fn resolve(engine: &ConflictEngine, local: &Patch, incoming: &Patch) -> Patch {
    engine.resolve(local, incoming, None).patch
}
