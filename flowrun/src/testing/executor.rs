//! A scripted stand-in for the external executor.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::core::{DispatchTask, RunStatus, TaskMetrics, TaskResult};
use crate::engine::ExecutionCoordinator;
use crate::errors::{EngineError, ErrorPayload};
use crate::observability::{run_span, task_span, SpanTimer};

/// What the executor reports for one attempt of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Succeed with these outputs.
    Succeed(Value),
    /// Succeed with these outputs, flagged as a cache hit.
    Cached(Value),
    /// Fail with this error.
    Fail(ErrorPayload),
    /// Report nothing, leaving the task RUNNING.
    Hang,
}

/// Polls a run and answers every dispatched task from a per-node script.
///
/// Nodes without a script, or whose script ran out, succeed with
/// `{"node": <node_id>}`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<DispatchTask>>,
}

impl ScriptedExecutor {
    /// Creates an executor where every node succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a step for the next attempt of `node_id`.
    #[must_use]
    pub fn then(self, node_id: impl Into<String>, step: Step) -> Self {
        self.scripts
            .lock()
            .entry(node_id.into())
            .or_default()
            .push_back(step);
        self
    }

    /// Queues a failure with `code` for the next attempt of `node_id`.
    #[must_use]
    pub fn fail(self, node_id: impl Into<String>, code: &str) -> Self {
        self.then(node_id, Step::Fail(ErrorPayload::new(code, "scripted failure")))
    }

    /// Every task dispatched so far, in dispatch order.
    #[must_use]
    pub fn calls(&self) -> Vec<DispatchTask> {
        self.calls.lock().clone()
    }

    /// Node ids dispatched so far, in dispatch order.
    #[must_use]
    pub fn called_nodes(&self) -> Vec<String> {
        self.calls.lock().iter().map(|t| t.node_id.clone()).collect()
    }

    fn next_step(&self, node_id: &str) -> Step {
        self.scripts
            .lock()
            .get_mut(node_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Step::Succeed(json!({"node": node_id})))
    }

    /// Claims one batch and reports a result for each task in it.
    ///
    /// Returns the number of tasks dispatched.
    pub async fn poll_once(
        &self,
        coordinator: &ExecutionCoordinator,
        run_id: Uuid,
    ) -> Result<usize, EngineError> {
        let batch = coordinator.execute_next_tasks(run_id).await?;
        let dispatched = batch.len();

        for task in batch {
            self.calls.lock().push(task.clone());
            let span = task_span("execute", run_id, task.id, &task.node_id);
            self.report(coordinator, &task).instrument(span).await?;
        }

        Ok(dispatched)
    }

    async fn report(
        &self,
        coordinator: &ExecutionCoordinator,
        task: &DispatchTask,
    ) -> Result<(), EngineError> {
        let timer = SpanTimer::start();
        let step = self.next_step(&task.node_id);

        if !coordinator.is_task_active(task.id).await? {
            debug!("Task no longer active, dropping result");
            return Ok(());
        }
        let metrics = TaskMetrics::with_duration_ms(timer.elapsed_ms());
        let result = match step {
            Step::Succeed(outputs) => TaskResult::success(outputs).with_metrics(metrics),
            Step::Cached(outputs) => TaskResult::success(outputs).with_metrics(metrics).from_cache(),
            Step::Fail(error) => TaskResult::failure(error).with_metrics(metrics),
            Step::Hang => return Ok(()),
        };
        coordinator.complete_task(task.id, result).await?;
        Ok(())
    }

    /// Polls until the run is terminal or `max_polls` is reached.
    ///
    /// Empty polls sleep briefly so that scheduled retries come due.
    pub async fn drive(
        &self,
        coordinator: &ExecutionCoordinator,
        run_id: Uuid,
        max_polls: usize,
    ) -> Result<RunStatus, EngineError> {
        self.drive_inner(coordinator, run_id, max_polls)
            .instrument(run_span("drive", run_id))
            .await
    }

    async fn drive_inner(
        &self,
        coordinator: &ExecutionCoordinator,
        run_id: Uuid,
        max_polls: usize,
    ) -> Result<RunStatus, EngineError> {
        for _ in 0..max_polls {
            let dispatched = self.poll_once(coordinator, run_id).await?;
            let status = coordinator.get_run(run_id).await?.status;
            if status.is_terminal() {
                return Ok(status);
            }
            if dispatched == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        Err(EngineError::InvalidState {
            operation: "drive".to_string(),
            current: format!("run {run_id} not terminal after {max_polls} polls"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, TestEngine};

    #[tokio::test]
    async fn test_scripts_are_consumed_in_order() {
        let executor = ScriptedExecutor::new()
            .then("n0", Step::Cached(json!({"hit": true})))
            .fail("n1", "BAD_INPUT");

        let engine = TestEngine::new(fixtures::linear(2));
        let run = engine.start().await;
        let status = executor.drive(&engine.coordinator, run.id, 50).await.unwrap();

        assert_eq!(status, RunStatus::Failed);
        assert_eq!(executor.called_nodes(), vec!["n0", "n1"]);
        let n0 = engine.coordinator.get_task(executor.calls()[0].id).await.unwrap();
        assert!(n0.cached);
    }

    #[tokio::test]
    async fn test_hang_leaves_task_running() {
        let executor = ScriptedExecutor::new().then("n0", Step::Hang);
        let engine = TestEngine::new(fixtures::linear(1));
        let run = engine.start().await;

        assert_eq!(executor.poll_once(&engine.coordinator, run.id).await.unwrap(), 1);
        let task_id = executor.calls()[0].id;
        assert!(engine.coordinator.is_task_active(task_id).await.unwrap());

        let err = executor.drive(&engine.coordinator, run.id, 3).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }
}
