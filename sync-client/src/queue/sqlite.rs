//! SQLite store for the offline queue.

use super::{DurableStore, QueueError};
use async_trait::async_trait;
use patchsync_types::{InstanceId, PatchId, QueueEntry};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-backed queue store.
///
/// Uses WAL mode. Rows are namespaced by [`InstanceId`], so replicas of
/// different objects can share one database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteStore {
    /// Open (or create) the database at `path` for `namespace`.
    pub async fn open(path: &Path, namespace: &InstanceId) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            namespace: namespace.as_str().to_string(),
        };
        store.run_migrations().await?;
        tracing::debug!(path = %path.display(), namespace = %namespace, "opened queue database");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory(namespace: &InstanceId) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // One connection: every connection to :memory: is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            namespace: namespace.as_str().to_string(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The namespace this store reads and writes.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn run_migrations(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_entries (
                namespace TEXT NOT NULL,
                patch_id TEXT NOT NULL,
                patch_timestamp INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                entry TEXT NOT NULL,
                PRIMARY KEY (namespace, patch_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_namespace_ts ON queue_entries(namespace, patch_timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn put(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let json = serde_json::to_string(entry)?;
        sqlx::query(
            r#"
            INSERT INTO queue_entries (namespace, patch_id, patch_timestamp, enqueued_at, attempt_count, entry)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(namespace, patch_id) DO UPDATE SET
                patch_timestamp = excluded.patch_timestamp,
                enqueued_at = excluded.enqueued_at,
                attempt_count = excluded.attempt_count,
                entry = excluded.entry
            "#,
        )
        .bind(&self.namespace)
        .bind(entry.id().as_str())
        .bind(entry.patch.timestamp)
        .bind(entry.enqueued_at)
        .bind(i64::from(entry.attempt_count))
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT patch_id, entry
            FROM queue_entries
            WHERE namespace = ?1
            ORDER BY patch_timestamp ASC, enqueued_at ASC
            "#,
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn delete(&self, id: &PatchId) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_entries WHERE namespace = ?1 AND patch_id = ?2")
            .bind(&self.namespace)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_entries WHERE namespace = ?1")
            .bind(&self.namespace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct EntryRow {
    patch_id: String,
    entry: String,
}

impl TryFrom<EntryRow> for QueueEntry {
    type Error = QueueError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        serde_json::from_str(&row.entry).map_err(|source| QueueError::Corrupt {
            id: row.patch_id,
            source,
        })
    }
}
