use super::{error::Result, error::StorageError, PrivacyRequest, RequestStatus, TaskStore};
use crate::core::{ActionType, RequestTask, TaskKey, TaskStatus, TaskUpdate};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default pool size for SQLite connection pool.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Configuration for the SQLite connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            max_lifetime: None,
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
        }
    }
}

/// SQLite-backed task store with connection pooling.
///
/// Each task row keeps its queryable attributes (triple, status, suspension)
/// in columns and the full [`RequestTask`] as a JSON `body`, plus a `version`
/// bumped on every write. An update reads the row outside any transaction and
/// writes it back with a single `UPDATE ... WHERE version = ?`. A writer that
/// lost the race re-reads and tries again, so no transaction ever has to
/// upgrade a read lock to a write lock while sibling tasks are being written.
pub struct SqliteTaskStore {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteTaskStore {
    /// Opens (or creates) a store at `db_path` with the default pool configuration.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(db_path, PoolConfig::default()).await
    }

    pub async fn with_config(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path_str))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = Self::build_pool(connect_options, &config).await?;
        let store = Self {
            pool,
            db_path: db_path_str,
        };
        store.initialize().await?;

        info!(path = %store.db_path, "opened sqlite task store");
        Ok(store)
    }

    /// Creates an in-memory store.
    ///
    /// Uses a single connection, since every connection to `:memory:` would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let config = PoolConfig {
            max_size: 1,
            min_idle: Some(0),
            ..PoolConfig::default()
        };

        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Memory)
            .synchronous(SqliteSynchronous::Normal);

        let pool = Self::build_pool(connect_options, &config).await?;
        let store = Self {
            pool,
            db_path: ":memory:".to_string(),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn build_pool(
        connect_options: SqliteConnectOptions,
        config: &PoolConfig,
    ) -> Result<Pool<Sqlite>> {
        let mut builder = SqlitePoolOptions::new()
            .max_connections(config.max_size)
            .acquire_timeout(config.connection_timeout);

        if let Some(min_idle) = config.min_idle {
            builder = builder.min_connections(min_idle);
        }
        if let Some(max_lifetime) = config.max_lifetime {
            builder = builder.max_lifetime(max_lifetime);
        }
        if let Some(idle_timeout) = config.idle_timeout {
            builder = builder.idle_timeout(idle_timeout);
        }

        builder
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS privacy_requests (
                id TEXT PRIMARY KEY,
                status TEXT CHECK( status IN ('pending','in_processing','paused','canceled',
                                              'awaiting_callback','complete','error') ) NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS request_tasks (
                id TEXT PRIMARY KEY,
                privacy_request_id TEXT NOT NULL,
                dataset TEXT NOT NULL,
                collection TEXT NOT NULL,
                action TEXT CHECK( action IN ('access','erasure') ) NOT NULL,
                status TEXT CHECK( status IN ('pending','in_processing','complete','error',
                                              'skipped','paused','requires_input') ) NOT NULL,
                async_type TEXT,
                async_deadline INTEGER,
                body TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (privacy_request_id, dataset, collection, action)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_tasks_request
             ON request_tasks(privacy_request_id, action)",
        )
        .execute(&self.pool)
        .await?;

        // Suspended-task scans for deadline expiry
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_tasks_suspended
             ON request_tasks(status, async_deadline)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS request_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL UNIQUE,
                enqueued_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the database path.
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn row_to_task(row: &SqliteRow) -> Result<RequestTask> {
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }

    fn row_to_request(row: &SqliteRow) -> Result<PrivacyRequest> {
        let body: String = row.try_get("body")?;
        let mut request: PrivacyRequest = serde_json::from_str(&body)?;

        // The status column is authoritative; it is updated without rewriting the body.
        let status: String = row.try_get("status")?;
        request.status = RequestStatus::from_str(&status)?;
        let updated_at: i64 = row.try_get("updated_at")?;
        if let Some(updated_at) = chrono::DateTime::from_timestamp_millis(updated_at) {
            request.updated_at = updated_at;
        }
        Ok(request)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save_request(&self, request: &PrivacyRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO privacy_requests (id, status, body, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(request.id.to_string())
        .bind(request.status.as_str())
        .bind(serde_json::to_string(request)?)
        .bind(request.created_at.timestamp_millis())
        .bind(request.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<PrivacyRequest>> {
        sqlx::query("SELECT status, body, updated_at FROM privacy_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_request(&row))
            .transpose()
    }

    async fn set_request_status(&self, id: Uuid, status: RequestStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE privacy_requests SET status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RequestNotFound(id));
        }
        Ok(())
    }

    async fn create_tasks(&self, tasks: Vec<RequestTask>) -> Result<Vec<RequestTask>> {
        // Writes come first so the transaction takes the write lock before it
        // reads anything.
        let mut tx = self.pool.begin().await?;

        for task in &tasks {
            let key = task.key();
            sqlx::query(
                "INSERT INTO request_tasks
                    (id, privacy_request_id, dataset, collection, action, status,
                     async_type, async_deadline, body, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(privacy_request_id, dataset, collection, action) DO NOTHING",
            )
            .bind(task.id().to_string())
            .bind(key.privacy_request_id.to_string())
            .bind(key.collection.dataset())
            .bind(key.collection.collection())
            .bind(key.action.as_str())
            .bind(task.status().as_str())
            .bind(task.async_type().map(|t| t.as_str()))
            .bind(task.async_deadline().map(|d| d.timestamp_millis()))
            .bind(serde_json::to_string(task)?)
            .bind(task.created_at().timestamp_millis())
            .bind(task.updated_at().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        let mut stored = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let key = task.key();
            let row = sqlx::query(
                "SELECT body FROM request_tasks
                 WHERE privacy_request_id = ? AND dataset = ? AND collection = ? AND action = ?",
            )
            .bind(key.privacy_request_id.to_string())
            .bind(key.collection.dataset())
            .bind(key.collection.collection())
            .bind(key.action.as_str())
            .fetch_one(&mut *tx)
            .await?;
            stored.push(Self::row_to_task(&row)?);
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<RequestTask>> {
        sqlx::query("SELECT body FROM request_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_task(&row))
            .transpose()
    }

    async fn get_task_by_key(&self, key: &TaskKey) -> Result<Option<RequestTask>> {
        sqlx::query(
            "SELECT body FROM request_tasks
             WHERE privacy_request_id = ? AND dataset = ? AND collection = ? AND action = ?",
        )
        .bind(key.privacy_request_id.to_string())
        .bind(key.collection.dataset())
        .bind(key.collection.collection())
        .bind(key.action.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| Self::row_to_task(&row))
        .transpose()
    }

    async fn tasks_for_request(
        &self,
        request_id: Uuid,
        action: Option<ActionType>,
    ) -> Result<Vec<RequestTask>> {
        let rows = match action {
            Some(action) => {
                sqlx::query(
                    "SELECT body FROM request_tasks
                     WHERE privacy_request_id = ? AND action = ?
                     ORDER BY rowid",
                )
                .bind(request_id.to_string())
                .bind(action.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT body FROM request_tasks
                     WHERE privacy_request_id = ?
                     ORDER BY rowid",
                )
                .bind(request_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_task(
        &self,
        id: Uuid,
        expected: Option<TaskStatus>,
        update: TaskUpdate,
    ) -> Result<Option<RequestTask>> {
        loop {
            let row = sqlx::query("SELECT body, version FROM request_tasks WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or(StorageError::TaskNotFound(id))?;
            let version: i64 = row.try_get("version")?;
            let mut task = Self::row_to_task(&row)?;
            let current = task.status();

            if expected.is_some_and(|expected| expected != current) {
                debug!(task_id = %id, actual = %current, "compare-and-swap lost");
                return Ok(None);
            }

            task.apply(update.clone())?;

            let result = sqlx::query(
                "UPDATE request_tasks
                 SET status = ?, async_type = ?, async_deadline = ?, body = ?, updated_at = ?,
                     version = version + 1
                 WHERE id = ? AND version = ?",
            )
            .bind(task.status().as_str())
            .bind(task.async_type().map(|t| t.as_str()))
            .bind(task.async_deadline().map(|d| d.timestamp_millis()))
            .bind(serde_json::to_string(&task)?)
            .bind(task.updated_at().timestamp_millis())
            .bind(id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(Some(task));
            }
            debug!(task_id = %id, "row changed concurrently, re-reading");
        }
    }

    async fn suspended_tasks(&self) -> Result<Vec<RequestTask>> {
        let rows = sqlx::query(
            "SELECT body FROM request_tasks
             WHERE status = 'in_processing' AND async_type IS NOT NULL
             ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn claimed_tasks(&self) -> Result<Vec<RequestTask>> {
        let rows = sqlx::query(
            "SELECT body FROM request_tasks
             WHERE status = 'in_processing' AND async_type IS NULL
             ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn overdue_tasks(&self, now: chrono::DateTime<Utc>) -> Result<Vec<RequestTask>> {
        let rows = sqlx::query(
            "SELECT body FROM request_tasks
             WHERE status = 'in_processing' AND async_type IS NOT NULL
               AND async_deadline IS NOT NULL AND async_deadline <= ?
             ORDER BY async_deadline",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn enqueue_request(&self, request_id: Uuid) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO request_queue (request_id, enqueued_at) VALUES (?, ?)")
            .bind(request_id.to_string())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dequeue_request(&self) -> Result<Option<Uuid>> {
        // Single atomic operation using DELETE...RETURNING (SQLite 3.35+)
        let row = sqlx::query(
            "DELETE FROM request_queue
             WHERE seq = (SELECT seq FROM request_queue ORDER BY seq LIMIT 1)
             RETURNING request_id",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.try_get("request_id")?;
        Uuid::parse_str(&id)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM request_queue").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM request_tasks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM privacy_requests").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
