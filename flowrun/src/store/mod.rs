//! Persistence ports for runs, tasks, and logs.
//!
//! The coordinator never holds run state in memory between calls; every
//! decision is re-derived from these stores. Two properties are required of
//! every implementation:
//!
//! - `transition` is a compare-and-swap: it applies the change only if the
//!   row's current status is in the transition's `allowed_from` set, and
//!   exactly one of several concurrent callers wins.
//! - `LogStore::append` assigns `max(sequence_number) + 1` for the run with
//!   appends to the same run serialized.
//!
//! A run row is only ever written after all of its task rows, through
//! [`Stores::create_run`], so any run a reader can see has its full task set.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryLogStore, MemoryRunStore, MemoryTaskStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStores;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{
    LogEntry, NewLogEntry, Run, RunTransition, Task, TaskStatus, TaskTransition,
};
use crate::errors::EngineError;
use crate::utils::Timestamp;

/// Persists run rows.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new run.
    async fn insert_run(&self, run: &Run) -> Result<(), EngineError>;

    /// Loads a run.
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError>;

    /// Applies `transition` if the run's status allows it.
    ///
    /// Returns the updated run, or `None` when the status no longer allowed
    /// the transition (another caller got there first).
    async fn transition(
        &self,
        run_id: Uuid,
        transition: &RunTransition,
        now: Timestamp,
    ) -> Result<Option<Run>, EngineError>;

    /// Stores fresh task counts and the progress derived from them.
    ///
    /// Conditional like `transition`: nothing is written when the run is
    /// terminal or `completed` is below the stored count (see
    /// [`Run::accepts_counts`]), and `None` is returned.
    async fn update_counts(
        &self,
        run_id: Uuid,
        completed: u32,
        total: u32,
        now: Timestamp,
    ) -> Result<Option<Run>, EngineError>;
}

/// Persists task rows.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts all tasks of a run in one batch.
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), EngineError>;

    /// Removes every task of a run. Used to undo a partially created run.
    async fn delete_tasks(&self, run_id: Uuid) -> Result<u64, EngineError>;

    /// Loads a task.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, EngineError>;

    /// Lists a run's tasks ordered by `execution_order`.
    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>, EngineError>;

    /// Applies `transition` if the task's status allows it.
    ///
    /// Returns the updated task, or `None` when another caller won.
    async fn transition(
        &self,
        task_id: Uuid,
        transition: &TaskTransition,
        now: Timestamp,
    ) -> Result<Option<Task>, EngineError>;

    /// Lists a run's tasks in `status`.
    async fn list_by_status(
        &self,
        run_id: Uuid,
        status: TaskStatus,
    ) -> Result<Vec<Task>, EngineError> {
        Ok(self
            .list_tasks(run_id)
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }
}

/// Append-only, per-run sequenced log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends an entry, assigning the next sequence number for its run.
    async fn append(&self, entry: NewLogEntry) -> Result<LogEntry, EngineError>;

    /// Returns entries with `sequence_number > after`, ascending, at most `limit`.
    async fn stream(
        &self,
        run_id: Uuid,
        after: u64,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, EngineError>;

    /// Returns the last `limit` entries, ascending.
    async fn recent(&self, run_id: Uuid, limit: usize) -> Result<Vec<LogEntry>, EngineError>;

    /// Returns the highest sequence number for the run, or 0.
    async fn last_sequence(&self, run_id: Uuid) -> Result<u64, EngineError>;
}

/// Explicit store handles injected into the coordinator.
#[derive(Clone)]
pub struct Stores {
    /// Run rows.
    pub runs: Arc<dyn RunStore>,
    /// Task rows.
    pub tasks: Arc<dyn TaskStore>,
    /// Log rows.
    pub logs: Arc<dyn LogStore>,
}

impl Stores {
    /// Bundles store handles.
    #[must_use]
    pub fn new(
        runs: Arc<dyn RunStore>,
        tasks: Arc<dyn TaskStore>,
        logs: Arc<dyn LogStore>,
    ) -> Self {
        Self { runs, tasks, logs }
    }

    /// Persists a new run together with its tasks.
    ///
    /// Task rows go first and the run row commits the pair. If the run insert
    /// fails the tasks are removed again; if that cleanup fails too, the
    /// leftover rows belong to a run id nobody can look up.
    pub async fn create_run(&self, run: &Run, tasks: &[Task]) -> Result<(), EngineError> {
        self.tasks.insert_tasks(tasks).await?;
        if let Err(e) = self.runs.insert_run(run).await {
            if let Err(cleanup) = self.tasks.delete_tasks(run.id).await {
                tracing::warn!(run_id = %run.id, error = %cleanup, "Failed to remove tasks of an uncreated run");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Fresh in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryLogStore::new()),
        )
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
