//! # sync-cli
//!
//! Operator CLI for patchsync.
//!
//! ## Commands
//!
//! - `diff`: Print the operations turning one JSON document into another
//! - `apply`: Apply operations (or a patch) to a document
//! - `resolve`: Resolve two conflicting patches
//! - `validate`: Check a patch for structural problems
//! - `queue`: Inspect or clear a SQLite offline queue
//!
//! ## Example
//!
//! ```bash
//! # What changed?
//! patchsync diff before.json after.json --path user.name
//!
//! # Replay it somewhere else
//! patchsync diff before.json after.json > ops.json
//! patchsync apply other.json ops.json
//!
//! # Which edit wins?
//! patchsync resolve local.json incoming.json --policy path-based
//!
//! # What is still waiting to be sent?
//! patchsync queue --database patchsync.db --id shopping-list list
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use patchsync_core::ConflictPolicy;
use std::path::PathBuf;

mod commands;

use commands::{apply, diff, queue, resolve, validate};

/// Operator CLI for patchsync.
#[derive(Parser, Debug)]
#[command(name = "patchsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the operations turning BEFORE into AFTER
    Diff {
        /// Original document
        before: PathBuf,

        /// Changed document
        after: PathBuf,

        /// Only compare these dotted paths (repeatable)
        #[arg(long = "path", short)]
        paths: Vec<String>,
    },

    /// Apply operations to a document and print the result
    Apply {
        /// Document to change
        document: PathBuf,

        /// Operation array or patch object
        operations: PathBuf,
    },

    /// Resolve two conflicting patches and print the result
    Resolve {
        /// The local patch
        local: PathBuf,

        /// The incoming patch
        incoming: PathBuf,

        /// Resolution policy
        #[arg(long, default_value = "last-write-wins")]
        policy: ConflictPolicy,

        /// How conflicting paths are detected
        #[arg(long, value_enum, default_value_t = resolve::Detection::Exact)]
        detection: resolve::Detection,
    },

    /// Check a patch for structural problems
    Validate {
        /// Patch file
        patch: PathBuf,
    },

    /// Inspect a SQLite offline queue
    Queue {
        /// Queue database
        #[arg(long)]
        database: PathBuf,

        /// Object id the queue belongs to
        #[arg(long)]
        id: String,

        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Show pending and failed counts
    Status,
    /// List queued patches, oldest first
    List,
    /// Drop every queued patch
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Diff {
            before,
            after,
            paths,
        } => {
            diff::run(&before, &after, &paths).await?;
        }
        Commands::Apply {
            document,
            operations,
        } => {
            apply::run(&document, &operations).await?;
        }
        Commands::Resolve {
            local,
            incoming,
            policy,
            detection,
        } => {
            resolve::run(&local, &incoming, policy, detection).await?;
        }
        Commands::Validate { patch } => {
            validate::run(&patch).await?;
        }
        Commands::Queue {
            database,
            id,
            action,
        } => match action {
            QueueAction::Status => queue::status(&database, &id).await?,
            QueueAction::List => queue::list(&database, &id).await?,
            QueueAction::Clear => queue::clear(&database, &id).await?,
        },
    }

    Ok(())
}
