//! SQLite-backed stores.
//!
//! Structured fields are stored as JSON text and timestamps as RFC 3339
//! strings; both are encoded and decoded only in this module. Conditional
//! transitions use an optimistic `version` column: a write only lands if
//! the row still has the version that was read, otherwise the transition is
//! re-evaluated against the fresh row.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::{LogStore, RunStore, Stores, TaskStore};
use crate::core::{
    LogEntry, NewLogEntry, Run, RunStatus, RunTransition, Task, TaskStatus, TaskTransition,
};
use crate::errors::EngineError;
use crate::utils::{format_timestamp, generate_uuid_v7, now_utc, parse_timestamp, parse_uuid, Timestamp};

const MAX_CAS_ATTEMPTS: usize = 16;

/// Owns the pool shared by the three SQLite stores.
#[derive(Debug, Clone)]
pub struct SqliteStores {
    pool: SqlitePool,
}

impl SqliteStores {
    /// Connects to `url` (e.g. `sqlite::memory:` or `sqlite://runs.db`).
    ///
    /// In-memory databases get a single long-lived connection, since each
    /// SQLite connection would otherwise see its own empty database.
    pub async fn connect(url: &str) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(EngineError::storage)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(EngineError::storage)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the engine tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), EngineError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS flowrun_runs (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                configuration TEXT NOT NULL,
                inputs TEXT NOT NULL,
                outputs TEXT,
                progress REAL NOT NULL DEFAULT 0,
                total_tasks INTEGER NOT NULL,
                completed_tasks INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled_for TEXT,
                timeout_at TEXT,
                error TEXT,
                metadata TEXT NOT NULL,
                queued_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                last_update_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_flowrun_runs_status
            ON flowrun_runs(status, priority, queued_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flowrun_tasks (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                config TEXT NOT NULL,
                status TEXT NOT NULL,
                dependencies TEXT NOT NULL,
                execution_order INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                retry_delay_ms INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                outputs TEXT,
                metrics TEXT,
                error TEXT,
                progress REAL NOT NULL DEFAULT 0,
                cache_key TEXT,
                cached INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                UNIQUE (run_id, node_id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_flowrun_tasks_run
            ON flowrun_tasks(run_id, status)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flowrun_logs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                task_id TEXT,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                category TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL,
                UNIQUE (run_id, sequence_number)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(EngineError::storage)?;
        }
        Ok(())
    }

    /// Returns store handles sharing this pool.
    #[must_use]
    pub fn stores(&self) -> Stores {
        Stores::new(
            std::sync::Arc::new(SqliteRunStore::new(self.pool.clone())),
            std::sync::Arc::new(SqliteTaskStore::new(self.pool.clone())),
            std::sync::Arc::new(SqliteLogStore::new(self.pool.clone())),
        )
    }
}

/// SQLite run store.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Creates a run store on `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_versioned(&self, run_id: Uuid) -> Result<Option<(Run, i64)>, EngineError> {
        let row = sqlx::query("SELECT * FROM flowrun_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::storage)?;
        row.map(|row| Ok((run_from_row(&row)?, col::<i64>(&row, "version")?)))
            .transpose()
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn insert_run(&self, run: &Run) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO flowrun_runs (
                id, pipeline_id, user_id, status, configuration, inputs, outputs,
                progress, total_tasks, completed_tasks, retry_count, max_retries,
                priority, scheduled_for, timeout_at, error, metadata,
                queued_at, started_at, completed_at, last_update_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.pipeline_id)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(encode(&run.configuration)?)
        .bind(encode(&run.inputs)?)
        .bind(encode_opt(run.outputs.as_ref())?)
        .bind(run.progress)
        .bind(i64::from(run.total_tasks))
        .bind(i64::from(run.completed_tasks))
        .bind(i64::from(run.retry_count))
        .bind(i64::from(run.max_retries))
        .bind(i64::from(run.priority))
        .bind(run.scheduled_for.as_ref().map(format_timestamp))
        .bind(run.timeout_at.as_ref().map(format_timestamp))
        .bind(encode_opt(run.error.as_ref())?)
        .bind(encode(&run.metadata)?)
        .bind(format_timestamp(&run.queued_at))
        .bind(run.started_at.as_ref().map(format_timestamp))
        .bind(run.completed_at.as_ref().map(format_timestamp))
        .bind(format_timestamp(&run.last_update_at))
        .execute(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.fetch_versioned(run_id).await?.map(|(run, _)| run))
    }

    async fn transition(
        &self,
        run_id: Uuid,
        transition: &RunTransition,
        now: Timestamp,
    ) -> Result<Option<Run>, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut run, version)) = self.fetch_versioned(run_id).await? else {
                return Err(EngineError::RunNotFound(run_id));
            };
            if !run.can_apply(transition) {
                return Ok(None);
            }
            run.apply(transition, now);

            let result = sqlx::query(
                r#"
                UPDATE flowrun_runs
                SET status = ?, outputs = ?, error = ?, retry_count = ?,
                    progress = ?, completed_tasks = ?,
                    queued_at = ?, started_at = ?, completed_at = ?, last_update_at = ?,
                    version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(run.status.as_str())
            .bind(encode_opt(run.outputs.as_ref())?)
            .bind(encode_opt(run.error.as_ref())?)
            .bind(i64::from(run.retry_count))
            .bind(run.progress)
            .bind(i64::from(run.completed_tasks))
            .bind(format_timestamp(&run.queued_at))
            .bind(run.started_at.as_ref().map(format_timestamp))
            .bind(run.completed_at.as_ref().map(format_timestamp))
            .bind(format_timestamp(&run.last_update_at))
            .bind(run_id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(EngineError::storage)?;

            if result.rows_affected() == 1 {
                return Ok(Some(run));
            }
        }
        Err(EngineError::Storage(format!(
            "run {run_id}: too much contention applying {}",
            transition.name()
        )))
    }

    async fn update_counts(
        &self,
        run_id: Uuid,
        completed: u32,
        total: u32,
        now: Timestamp,
    ) -> Result<Option<Run>, EngineError> {
        let progress = crate::core::compute_progress(completed, total);
        let result = sqlx::query(
            r#"
            UPDATE flowrun_runs
            SET completed_tasks = ?, total_tasks = ?, progress = ?, last_update_at = ?,
                version = version + 1
            WHERE id = ? AND status IN ('QUEUED', 'RUNNING') AND completed_tasks <= ?
            "#,
        )
        .bind(i64::from(completed))
        .bind(i64::from(total))
        .bind(progress)
        .bind(format_timestamp(&now))
        .bind(run_id.to_string())
        .bind(i64::from(completed))
        .execute(&self.pool)
        .await
        .map_err(EngineError::storage)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_run(run_id).await
    }
}

/// SQLite task store.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Creates a task store on `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_versioned(&self, task_id: Uuid) -> Result<Option<(Task, i64)>, EngineError> {
        let row = sqlx::query("SELECT * FROM flowrun_tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::storage)?;
        row.map(|row| Ok((task_from_row(&row)?, col::<i64>(&row, "version")?)))
            .transpose()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(EngineError::storage)?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO flowrun_tasks (
                    id, run_id, node_id, node_type, config, status, dependencies,
                    execution_order, retry_count, max_retries, retry_delay_ms,
                    next_retry_at, outputs, metrics, error, progress, cache_key, cached,
                    created_at, started_at, completed_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.id.to_string())
            .bind(task.run_id.to_string())
            .bind(&task.node_id)
            .bind(&task.node_type)
            .bind(encode(&task.config)?)
            .bind(task.status.as_str())
            .bind(encode(&task.dependencies)?)
            .bind(i64::from(task.execution_order))
            .bind(i64::from(task.retry_count))
            .bind(i64::from(task.max_retries))
            .bind(to_i64(task.retry_delay_ms))
            .bind(task.next_retry_at.as_ref().map(format_timestamp))
            .bind(encode_opt(task.outputs.as_ref())?)
            .bind(encode_opt(task.metrics.as_ref())?)
            .bind(encode_opt(task.error.as_ref())?)
            .bind(task.progress)
            .bind(task.cache_key.as_deref())
            .bind(i64::from(task.cached))
            .bind(format_timestamp(&task.created_at))
            .bind(task.started_at.as_ref().map(format_timestamp))
            .bind(task.completed_at.as_ref().map(format_timestamp))
            .bind(format_timestamp(&task.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(EngineError::storage)?;
        }

        tx.commit().await.map_err(EngineError::storage)?;
        Ok(())
    }

    async fn delete_tasks(&self, run_id: Uuid) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM flowrun_tasks WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(EngineError::storage)?;
        Ok(result.rows_affected())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, EngineError> {
        Ok(self.fetch_versioned(task_id).await?.map(|(task, _)| task))
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM flowrun_tasks WHERE run_id = ? ORDER BY execution_order, node_id",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn list_by_status(
        &self,
        run_id: Uuid,
        status: TaskStatus,
    ) -> Result<Vec<Task>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM flowrun_tasks
            WHERE run_id = ? AND status = ?
            ORDER BY execution_order, node_id
            "#,
        )
        .bind(run_id.to_string())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn transition(
        &self,
        task_id: Uuid,
        transition: &TaskTransition,
        now: Timestamp,
    ) -> Result<Option<Task>, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut task, version)) = self.fetch_versioned(task_id).await? else {
                return Err(EngineError::TaskNotFound(task_id));
            };
            if !task.can_apply(transition) {
                return Ok(None);
            }
            task.apply(transition, now);

            let result = sqlx::query(
                r#"
                UPDATE flowrun_tasks
                SET status = ?, retry_count = ?, next_retry_at = ?, outputs = ?, metrics = ?,
                    error = ?, progress = ?, cached = ?, started_at = ?, completed_at = ?,
                    updated_at = ?, version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(task.status.as_str())
            .bind(i64::from(task.retry_count))
            .bind(task.next_retry_at.as_ref().map(format_timestamp))
            .bind(encode_opt(task.outputs.as_ref())?)
            .bind(encode_opt(task.metrics.as_ref())?)
            .bind(encode_opt(task.error.as_ref())?)
            .bind(task.progress)
            .bind(i64::from(task.cached))
            .bind(task.started_at.as_ref().map(format_timestamp))
            .bind(task.completed_at.as_ref().map(format_timestamp))
            .bind(format_timestamp(&task.updated_at))
            .bind(task_id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(EngineError::storage)?;

            if result.rows_affected() == 1 {
                return Ok(Some(task));
            }
        }
        Err(EngineError::Storage(format!(
            "task {task_id}: too much contention applying {}",
            transition.name()
        )))
    }
}

/// SQLite log store.
#[derive(Debug, Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Creates a log store on `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn append(&self, entry: NewLogEntry) -> Result<LogEntry, EngineError> {
        let id = generate_uuid_v7();
        let timestamp = now_utc();

        // A single INSERT ... SELECT runs under SQLite's write lock, so the
        // max+1 read and the insert cannot interleave with another append.
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO flowrun_logs (
                id, run_id, task_id, level, message, category,
                sequence_number, timestamp, metadata
            )
            SELECT ?, ?, ?, ?, ?, ?, COALESCE(MAX(sequence_number), 0) + 1, ?, ?
            FROM flowrun_logs WHERE run_id = ?
            RETURNING sequence_number
            "#,
        )
        .bind(id.to_string())
        .bind(entry.run_id.to_string())
        .bind(entry.task_id.map(|t| t.to_string()))
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.category.as_str())
        .bind(format_timestamp(&timestamp))
        .bind(encode(&entry.metadata)?)
        .bind(entry.run_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(EngineError::storage)?;

        let sequence = u64::try_from(sequence).map_err(EngineError::storage)?;
        Ok(entry.into_entry(id, sequence, timestamp))
    }

    async fn stream(
        &self,
        run_id: Uuid,
        after: u64,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, EngineError> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            r#"
            SELECT * FROM flowrun_logs
            WHERE run_id = ? AND sequence_number > ?
            ORDER BY sequence_number ASC
            LIMIT ?
            "#,
        )
        .bind(run_id.to_string())
        .bind(to_i64(after))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        rows.iter().map(log_from_row).collect()
    }

    async fn recent(&self, run_id: Uuid, limit: usize) -> Result<Vec<LogEntry>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM flowrun_logs
            WHERE run_id = ?
            ORDER BY sequence_number DESC
            LIMIT ?
            "#,
        )
        .bind(run_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        let mut entries = rows.iter().map(log_from_row).collect::<Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn last_sequence(&self, run_id: Uuid) -> Result<u64, EngineError> {
        let last: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM flowrun_logs WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        u64::try_from(last).map_err(EngineError::storage)
    }
}

fn col<T>(row: &SqliteRow, name: &str) -> Result<T, EngineError>
where
    T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get::<T, _>(name).map_err(EngineError::storage)
}

fn u32_col(row: &SqliteRow, name: &str) -> Result<u32, EngineError> {
    let value: i64 = col(row, name)?;
    u32::try_from(value).map_err(|_| EngineError::Storage(format!("{name} out of range: {value}")))
}

fn uuid_col(row: &SqliteRow, name: &str) -> Result<Uuid, EngineError> {
    let value: String = col(row, name)?;
    parse_uuid(&value).map_err(EngineError::storage)
}

fn ts_col(row: &SqliteRow, name: &str) -> Result<Timestamp, EngineError> {
    let value: String = col(row, name)?;
    parse_timestamp(&value).map_err(EngineError::storage)
}

fn opt_ts_col(row: &SqliteRow, name: &str) -> Result<Option<Timestamp>, EngineError> {
    let value: Option<String> = col(row, name)?;
    value
        .map(|v| parse_timestamp(&v).map_err(EngineError::storage))
        .transpose()
}

fn json_col<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<T, EngineError> {
    let value: String = col(row, name)?;
    Ok(serde_json::from_str(&value)?)
}

fn opt_json_col<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<Option<T>, EngineError> {
    let value: Option<String> = col(row, name)?;
    value
        .map(|v| serde_json::from_str(&v).map_err(EngineError::from))
        .transpose()
}

fn parsed_col<T: FromStr<Err = String>>(row: &SqliteRow, name: &str) -> Result<T, EngineError> {
    let value: String = col(row, name)?;
    value.parse::<T>().map_err(EngineError::Storage)
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, EngineError> {
    Ok(serde_json::to_string(value)?)
}

fn encode_opt<T: Serialize>(value: Option<&T>) -> Result<Option<String>, EngineError> {
    value.map(encode).transpose()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn run_from_row(row: &SqliteRow) -> Result<Run, EngineError> {
    let priority: i64 = col(row, "priority")?;
    Ok(Run {
        id: uuid_col(row, "id")?,
        pipeline_id: col(row, "pipeline_id")?,
        user_id: col(row, "user_id")?,
        status: parsed_col::<RunStatus>(row, "status")?,
        configuration: json_col(row, "configuration")?,
        inputs: json_col(row, "inputs")?,
        outputs: opt_json_col(row, "outputs")?,
        progress: col(row, "progress")?,
        total_tasks: u32_col(row, "total_tasks")?,
        completed_tasks: u32_col(row, "completed_tasks")?,
        retry_count: u32_col(row, "retry_count")?,
        max_retries: u32_col(row, "max_retries")?,
        priority: i32::try_from(priority).map_err(EngineError::storage)?,
        scheduled_for: opt_ts_col(row, "scheduled_for")?,
        timeout_at: opt_ts_col(row, "timeout_at")?,
        error: opt_json_col(row, "error")?,
        metadata: json_col(row, "metadata")?,
        queued_at: ts_col(row, "queued_at")?,
        started_at: opt_ts_col(row, "started_at")?,
        completed_at: opt_ts_col(row, "completed_at")?,
        last_update_at: ts_col(row, "last_update_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, EngineError> {
    let retry_delay_ms: i64 = col(row, "retry_delay_ms")?;
    let cached: i64 = col(row, "cached")?;
    Ok(Task {
        id: uuid_col(row, "id")?,
        run_id: uuid_col(row, "run_id")?,
        node_id: col(row, "node_id")?,
        node_type: col(row, "node_type")?,
        config: json_col(row, "config")?,
        status: parsed_col::<TaskStatus>(row, "status")?,
        dependencies: json_col(row, "dependencies")?,
        execution_order: u32_col(row, "execution_order")?,
        retry_count: u32_col(row, "retry_count")?,
        max_retries: u32_col(row, "max_retries")?,
        retry_delay_ms: u64::try_from(retry_delay_ms).map_err(EngineError::storage)?,
        next_retry_at: opt_ts_col(row, "next_retry_at")?,
        outputs: opt_json_col(row, "outputs")?,
        metrics: opt_json_col(row, "metrics")?,
        error: opt_json_col(row, "error")?,
        progress: col(row, "progress")?,
        cache_key: col(row, "cache_key")?,
        cached: cached != 0,
        created_at: ts_col(row, "created_at")?,
        started_at: opt_ts_col(row, "started_at")?,
        completed_at: opt_ts_col(row, "completed_at")?,
        updated_at: ts_col(row, "updated_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<LogEntry, EngineError> {
    let task_id: Option<String> = col(row, "task_id")?;
    let sequence: i64 = col(row, "sequence_number")?;
    Ok(LogEntry {
        id: uuid_col(row, "id")?,
        run_id: uuid_col(row, "run_id")?,
        task_id: task_id
            .map(|t| parse_uuid(&t).map_err(EngineError::storage))
            .transpose()?,
        level: parsed_col(row, "level")?,
        message: col(row, "message")?,
        category: parsed_col(row, "category")?,
        sequence_number: u64::try_from(sequence).map_err(EngineError::storage)?,
        timestamp: ts_col(row, "timestamp")?,
        metadata: json_col(row, "metadata")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LogCategory;
    use crate::definition::{NodeDefinition, PipelineConfiguration};
    use crate::errors::ErrorPayload;
    use std::collections::BTreeSet;

    async fn stores() -> SqliteStores {
        let stores = SqliteStores::connect("sqlite::memory:").await.unwrap();
        stores.migrate().await.unwrap();
        stores
    }

    fn run() -> Run {
        let config = PipelineConfiguration::new().node(NodeDefinition::new("a", "noop"));
        let mut run = Run::new("p", "u", config, serde_json::json!({"x": 1}), now_utc());
        run.max_retries = 2;
        run.timeout_at = Some(now_utc());
        run
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let stores = stores().await;
        stores.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_roundtrip_and_transition() {
        let sqlite = stores().await;
        let runs = SqliteRunStore::new(sqlite.pool().clone());
        let run = run();
        runs.insert_run(&run).await.unwrap();

        let loaded = runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_id, "p");
        assert_eq!(loaded.inputs["x"], 1);
        assert_eq!(loaded.configuration, run.configuration);
        assert_eq!(loaded.max_retries, 2);
        assert!(loaded.timeout_at.is_some());

        let started = runs.transition(run.id, &RunTransition::Start, now_utc()).await.unwrap();
        assert_eq!(started.unwrap().status, RunStatus::Running);
        assert!(runs
            .transition(run.id, &RunTransition::Start, now_utc())
            .await
            .unwrap()
            .is_none());

        let failed = runs
            .transition(
                run.id,
                &RunTransition::Fail { error: ErrorPayload::new("TASK_FAILED", "boom") },
                now_utc(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.error.unwrap().code, "TASK_FAILED");

        let reloaded = runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
        assert!(reloaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_counts_keeps_status() {
        let sqlite = stores().await;
        let runs = SqliteRunStore::new(sqlite.pool().clone());
        let run = run();
        runs.insert_run(&run).await.unwrap();

        let updated = runs.update_counts(run.id, 1, 2, now_utc()).await.unwrap().unwrap();
        assert_eq!(updated.progress, 0.5);
        assert_eq!(updated.status, RunStatus::Queued);
        assert!(runs.update_counts(Uuid::new_v4(), 0, 1, now_utc()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_counts_is_conditional() {
        let sqlite = stores().await;
        let runs = SqliteRunStore::new(sqlite.pool().clone());
        let run = run();
        runs.insert_run(&run).await.unwrap();

        runs.update_counts(run.id, 1, 2, now_utc()).await.unwrap().unwrap();
        assert!(runs.update_counts(run.id, 0, 2, now_utc()).await.unwrap().is_none());

        let done = RunTransition::Complete { outputs: serde_json::json!({}) };
        runs.transition(run.id, &done, now_utc()).await.unwrap().unwrap();
        assert!(runs.update_counts(run.id, 0, 2, now_utc()).await.unwrap().is_none());

        let stored = runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.completed_tasks, 2);
        assert_eq!(stored.progress, 1.0);
    }

    #[tokio::test]
    async fn test_task_roundtrip_and_claim() {
        let sqlite = stores().await;
        let tasks = SqliteTaskStore::new(sqlite.pool().clone());
        let run_id = Uuid::new_v4();
        let mut task = Task::new(
            run_id,
            "b",
            "map",
            BTreeSet::from(["a".to_string()]),
            now_utc(),
        );
        task.config = serde_json::json!({"k": "v"});
        task.cache_key = Some("task:abc".into());
        task.max_retries = 3;
        tasks.insert_tasks(&[task.clone()]).await.unwrap();

        let loaded = tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.dependencies, task.dependencies);
        assert_eq!(loaded.config["k"], "v");
        assert_eq!(loaded.cache_key.as_deref(), Some("task:abc"));

        let claimed = tasks.transition(task.id, &TaskTransition::Claim, now_utc()).await.unwrap();
        assert_eq!(claimed.unwrap().status, TaskStatus::Running);
        assert!(tasks
            .transition(task.id, &TaskTransition::Claim, now_utc())
            .await
            .unwrap()
            .is_none());

        let running = tasks.list_by_status(run_id, TaskStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_node_rows_rejected() {
        let sqlite = stores().await;
        let tasks = SqliteTaskStore::new(sqlite.pool().clone());
        let run_id = Uuid::new_v4();
        let a = Task::new(run_id, "a", "t", BTreeSet::new(), now_utc());
        let dup = Task::new(run_id, "a", "t", BTreeSet::new(), now_utc());

        assert!(tasks.insert_tasks(&[a, dup]).await.is_err());
        assert!(tasks.list_tasks(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_tasks_removes_run_rows() {
        let sqlite = stores().await;
        let tasks = SqliteTaskStore::new(sqlite.pool().clone());
        let run_id = Uuid::new_v4();
        let other = Task::new(Uuid::new_v4(), "a", "t", BTreeSet::new(), now_utc());
        tasks
            .insert_tasks(&[
                Task::new(run_id, "a", "t", BTreeSet::new(), now_utc()),
                Task::new(run_id, "b", "t", BTreeSet::new(), now_utc()),
                other.clone(),
            ])
            .await
            .unwrap();

        assert_eq!(tasks.delete_tasks(run_id).await.unwrap(), 2);
        assert!(tasks.list_tasks(run_id).await.unwrap().is_empty());
        assert!(tasks.get_task(other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_log_sequence_and_stream() {
        let sqlite = stores().await;
        let logs = SqliteLogStore::new(sqlite.pool().clone());
        let run_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        for i in 0..4 {
            let entry = NewLogEntry::info(run_id, LogCategory::Task, format!("entry {i}"))
                .with_task(task_id)
                .with_metadata(serde_json::json!({"i": i}));
            let stored = logs.append(entry).await.unwrap();
            assert_eq!(stored.sequence_number, i + 1);
        }

        let tail = logs.stream(run_id, 2, None).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(tail[0].task_id, Some(task_id));
        assert_eq!(tail[0].metadata["i"], 2);

        assert_eq!(logs.stream(run_id, 0, Some(3)).await.unwrap().len(), 3);
        let recent = logs.recent(run_id, 2).await.unwrap();
        assert_eq!(recent.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(logs.last_sequence(run_id).await.unwrap(), 4);
        assert_eq!(logs.last_sequence(Uuid::new_v4()).await.unwrap(), 0);
    }
}
