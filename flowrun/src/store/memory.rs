//! In-memory stores.
//!
//! State lives in maps guarded by `parking_lot` locks; every check-and-set
//! happens under a single write guard, which gives the same conditional
//! update guarantees as the SQL adapter within one process.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{LogStore, RunStore, TaskStore};
use crate::core::{LogEntry, NewLogEntry, Run, RunTransition, Task, TaskTransition};
use crate::errors::EngineError;
use crate::utils::{generate_uuid_v7, now_utc, Timestamp};

/// In-memory run store.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl MemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert_run(&self, run: &Run) -> Result<(), EngineError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(EngineError::Storage(format!("run {} already exists", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn transition(
        &self,
        run_id: Uuid,
        transition: &RunTransition,
        now: Timestamp,
    ) -> Result<Option<Run>, EngineError> {
        let mut runs = self.runs.write();
        let Some(run) = runs.get_mut(&run_id) else {
            return Err(EngineError::RunNotFound(run_id));
        };
        if !run.can_apply(transition) {
            return Ok(None);
        }
        run.apply(transition, now);
        Ok(Some(run.clone()))
    }

    async fn update_counts(
        &self,
        run_id: Uuid,
        completed: u32,
        total: u32,
        now: Timestamp,
    ) -> Result<Option<Run>, EngineError> {
        let mut runs = self.runs.write();
        Ok(runs
            .get_mut(&run_id)
            .filter(|run| run.accepts_counts(completed))
            .map(|run| {
                run.set_counts(completed, total, now);
                run.clone()
            }))
    }
}

#[derive(Debug, Default)]
struct TaskTables {
    tasks: HashMap<Uuid, Task>,
    by_run: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory task store.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    inner: RwLock<TaskTables>,
}

impl MemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks across all runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        if let Some(dup) = tasks.iter().find(|t| inner.tasks.contains_key(&t.id)) {
            return Err(EngineError::Storage(format!("task {} already exists", dup.id)));
        }
        for task in tasks {
            inner.by_run.entry(task.run_id).or_default().push(task.id);
            inner.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn delete_tasks(&self, run_id: Uuid) -> Result<u64, EngineError> {
        let mut inner = self.inner.write();
        let ids = inner.by_run.remove(&run_id).unwrap_or_default();
        for id in &ids {
            inner.tasks.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, EngineError> {
        Ok(self.inner.read().tasks.get(&task_id).cloned())
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>, EngineError> {
        let inner = self.inner.read();
        let mut tasks: Vec<Task> = inner
            .by_run
            .get(&run_id)
            .map(|ids| ids.iter().filter_map(|id| inner.tasks.get(id)).cloned().collect())
            .unwrap_or_default();
        tasks.sort_by(|a, b| {
            a.execution_order
                .cmp(&b.execution_order)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        Ok(tasks)
    }

    async fn transition(
        &self,
        task_id: Uuid,
        transition: &TaskTransition,
        now: Timestamp,
    ) -> Result<Option<Task>, EngineError> {
        let mut inner = self.inner.write();
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Err(EngineError::TaskNotFound(task_id));
        };
        if !task.can_apply(transition) {
            return Ok(None);
        }
        task.apply(transition, now);
        Ok(Some(task.clone()))
    }
}

/// In-memory log store.
///
/// Each run's entries sit behind their own map shard entry; holding the
/// entry guard while computing `last + 1` serializes appends per run while
/// appends to different runs proceed in parallel.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    logs: DashMap<Uuid, Vec<LogEntry>>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries for a run.
    #[must_use]
    pub fn count(&self, run_id: Uuid) -> usize {
        self.logs.get(&run_id).map_or(0, |entries| entries.len())
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entry: NewLogEntry) -> Result<LogEntry, EngineError> {
        let mut entries = self.logs.entry(entry.run_id).or_default();
        let next = entries.last().map_or(1, |last| last.sequence_number + 1);
        let stored = entry.into_entry(generate_uuid_v7(), next, now_utc());
        entries.push(stored.clone());
        Ok(stored)
    }

    async fn stream(
        &self,
        run_id: Uuid,
        after: u64,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, EngineError> {
        let Some(entries) = self.logs.get(&run_id) else {
            return Ok(Vec::new());
        };
        // Entries are stored in sequence order, starting at 1.
        let start = entries.partition_point(|e| e.sequence_number <= after);
        let tail = &entries[start..];
        let take = limit.unwrap_or(tail.len()).min(tail.len());
        Ok(tail[..take].to_vec())
    }

    async fn recent(&self, run_id: Uuid, limit: usize) -> Result<Vec<LogEntry>, EngineError> {
        let Some(entries) = self.logs.get(&run_id) else {
            return Ok(Vec::new());
        };
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }

    async fn last_sequence(&self, run_id: Uuid) -> Result<u64, EngineError> {
        Ok(self
            .logs
            .get(&run_id)
            .and_then(|entries| entries.last().map(|e| e.sequence_number))
            .unwrap_or(0))
    }
}
