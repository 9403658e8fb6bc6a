use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::debug;

use super::{
    AppendOutcome, HistoryStore, IdempotencyKey, InstanceInfo, InstanceStatus, ProviderError, outcome_source,
    terminal_projection,
};
use crate::{Event, EventKind};

/// SQLite-backed history store.
///
/// File databases run in WAL mode and survive process restarts, which is what
/// crash recovery relies on. Every append runs in a `BEGIN IMMEDIATE`
/// transaction so the dedup check, sequence assignment, history insert and
/// projection update commit together. The transaction runs on its own task and
/// rolls back if it is dropped before COMMIT.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Convert sqlx error to ProviderError with retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }
        if matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_))
            || error_msg.contains("connection")
            || error_msg.contains("timeout")
        {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }
        ProviderError::retryable(operation, error_msg)
    }

    /// Open a store from a connection string such as `sqlite:data.db?mode=rwc`
    /// or `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqlitePoolOptions::new();
        if is_memory {
            // the database lives as long as its single connection
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            options = options.max_connections(5);
        }
        let pool = options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "duraflow::providers::sqlite", database_url, "SQLite history store ready");
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        Self::new(&format!("sqlite:{}?mode=rwc", path.as_ref().display())).await
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    /// Close the pool; pending operations finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                input TEXT NOT NULL,
                output TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status)"#)
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                dedup_class TEXT NOT NULL,
                dedup_slot INTEGER NOT NULL,
                event_data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (instance_id, event_id),
                UNIQUE (instance_id, dedup_class, dedup_slot)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn append_in_tx(
        conn: &mut SqliteConnection,
        instance: &str,
        kind: EventKind,
    ) -> Result<AppendOutcome, ProviderError> {
        let op = "append";
        let key = IdempotencyKey::of(&kind);
        let now = crate::now_millis() as i64;

        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT event_id FROM history WHERE instance_id = ? AND dedup_class = ? AND dedup_slot = ?",
        )
        .bind(instance)
        .bind(key.class.as_str())
        .bind(key.slot as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        if let Some((event_id,)) = existing {
            return Ok(AppendOutcome::Duplicate(event_id as u64));
        }

        match (&status, &kind) {
            (None, EventKind::OrchestrationStarted { name, input }) => {
                sqlx::query(
                    "INSERT INTO instances (instance_id, orchestration_name, status, input, created_at, updated_at) \
                     VALUES (?, ?, 'Running', ?, ?, ?)",
                )
                .bind(instance)
                .bind(name)
                .bind(input)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            }
            (None, _) => {
                return Err(ProviderError::permanent(op, format!("instance not found: {instance}")));
            }
            (Some((status,)), EventKind::ActivityScheduled { .. })
                if InstanceStatus::parse(status).is_some_and(|s| s.is_terminal()) =>
            {
                return Ok(AppendOutcome::InstanceTerminal);
            }
            (Some(_), _) => {}
        }

        if let Some(source) = outcome_source(&kind) {
            let source_type: Option<(String,)> =
                sqlx::query_as("SELECT event_type FROM history WHERE instance_id = ? AND event_id = ?")
                    .bind(instance)
                    .bind(source as i64)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            if !matches!(source_type, Some((ref t,)) if t == "ActivityScheduled") {
                return Err(ProviderError::permanent(
                    op,
                    format!("outcome references unknown ActivityScheduled {source} on {instance}"),
                ));
            }
        }

        let (last,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(event_id), 0) FROM history WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let event_id = (last + 1) as u64;

        let event_type = kind.type_name();
        let projection = terminal_projection(&kind);
        let event = Event {
            event_id,
            timestamp_ms: now as u64,
            kind,
        };
        let event_data = serde_json::to_string(&event)
            .map_err(|e| ProviderError::permanent(op, format!("Serialization error: {e}")))?;

        sqlx::query(
            "INSERT INTO history (instance_id, event_id, event_type, dedup_class, dedup_slot, event_data, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(instance)
        .bind(event_id as i64)
        .bind(event_type)
        .bind(key.class.as_str())
        .bind(key.slot as i64)
        .bind(event_data)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        match projection {
            Some((status, output, error)) => {
                sqlx::query(
                    "UPDATE instances SET status = ?, output = ?, error = ?, updated_at = ? WHERE instance_id = ?",
                )
                .bind(status.as_str())
                .bind(output)
                .bind(error)
                .bind(now)
                .bind(instance)
                .execute(&mut *conn)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            }
            None => {
                sqlx::query("UPDATE instances SET updated_at = ? WHERE instance_id = ?")
                    .bind(now)
                    .bind(instance)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            }
        }

        Ok(AppendOutcome::Appended(event_id))
    }

    async fn delete_in_tx(conn: &mut SqliteConnection, instance: &str) -> Result<bool, ProviderError> {
        let op = "delete_instance";
        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let Some((status,)) = status else {
            return Ok(false);
        };
        if !InstanceStatus::parse(&status).is_some_and(|s| s.is_terminal()) {
            return Err(ProviderError::permanent(op, format!("instance is still running: {instance}")));
        }
        sqlx::query("DELETE FROM history WHERE instance_id = ?")
            .bind(instance)
            .execute(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance)
            .execute(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(true)
    }

    fn row_to_info(row: &sqlx::sqlite::SqliteRow) -> Result<InstanceInfo, ProviderError> {
        let op = "get_instance";
        let status: String = row.try_get("status").map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let status = InstanceStatus::parse(&status)
            .ok_or_else(|| ProviderError::permanent(op, format!("unknown instance status: {status}")))?;
        let created_at: i64 = row.try_get("created_at").map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let updated_at: i64 = row.try_get("updated_at").map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(InstanceInfo {
            instance_id: row.try_get("instance_id").map_err(|e| Self::sqlx_to_provider_error(op, e))?,
            orchestration_name: row
                .try_get("orchestration_name")
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?,
            status,
            input: row.try_get("input").map_err(|e| Self::sqlx_to_provider_error(op, e))?,
            output: row.try_get("output").map_err(|e| Self::sqlx_to_provider_error(op, e))?,
            error: row.try_get("error").map_err(|e| Self::sqlx_to_provider_error(op, e))?,
            created_at_ms: created_at as u64,
            updated_at_ms: updated_at as u64,
        })
    }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, instance: &str, kind: EventKind) -> Result<AppendOutcome, ProviderError> {
        let pool = self.pool.clone();
        let instance_id = instance.to_string();
        // Detached so a dropped caller can't interrupt the transaction between BEGIN and COMMIT.
        let outcome = tokio::spawn(async move {
            let mut tx = pool
                .begin_with("BEGIN IMMEDIATE")
                .await
                .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
            let outcome = Self::append_in_tx(&mut tx, &instance_id, kind).await?;
            tx.commit()
                .await
                .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
            Ok::<_, ProviderError>(outcome)
        })
        .await
        .map_err(|e| ProviderError::permanent("append", format!("append task failed: {e}")))??;
        debug!(target: "duraflow::providers::sqlite", instance_id = %instance, ?outcome, "append");
        Ok(outcome)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT event_data FROM history WHERE instance_id = ? ORDER BY event_id")
                .bind(instance)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        rows.into_iter()
            .map(|(data,)| {
                serde_json::from_str::<Event>(&data)
                    .map_err(|e| ProviderError::permanent("read", format!("Deserialization error: {e}")))
            })
            .collect()
    }

    async fn exists(&self, instance: &str) -> Result<bool, ProviderError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("exists", e))?;
        Ok(count > 0)
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let row = sqlx::query(
            "SELECT instance_id, orchestration_name, status, input, output, error, created_at, updated_at \
             FROM instances WHERE instance_id = ?",
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("get_instance", e))?;
        row.as_ref().map(Self::row_to_info).transpose()
    }

    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<String>, ProviderError> {
        let rows: Vec<(String,)> = match status {
            Some(status) => {
                sqlx::query_as("SELECT instance_id FROM instances WHERE status = ? ORDER BY instance_id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as("SELECT instance_id FROM instances ORDER BY instance_id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_instance(&self, instance: &str) -> Result<bool, ProviderError> {
        let pool = self.pool.clone();
        let instance_id = instance.to_string();
        tokio::spawn(async move {
            let mut tx = pool
                .begin_with("BEGIN IMMEDIATE")
                .await
                .map_err(|e| Self::sqlx_to_provider_error("delete_instance", e))?;
            let deleted = Self::delete_in_tx(&mut tx, &instance_id).await?;
            tx.commit()
                .await
                .map_err(|e| Self::sqlx_to_provider_error("delete_instance", e))?;
            Ok::<_, ProviderError>(deleted)
        })
        .await
        .map_err(|e| ProviderError::permanent("delete_instance", format!("delete task failed: {e}")))?
    }
}
