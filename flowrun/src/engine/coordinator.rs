//! The execution coordinator.
//!
//! Every operation re-reads what it needs from the stores and commits its
//! changes through conditional transitions, so any number of coordinators
//! can poll the same run. Nothing about a run lives in memory between calls.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{DanglingDependencyPolicy, EngineConfig, RunOptions};
use super::readiness::{has_forward_progress, ready_tasks};
use super::retry::RetryDecision;
use super::status::{ExecutionStatus, ProgressSummary};
use crate::core::{
    DispatchTask, LogCategory, LogEntry, NewLogEntry, Run, RunStatus, RunTransition, Task,
    TaskMetrics, TaskResult, TaskStatus, TaskTransition,
};
use crate::definition::{ConfigurationProvider, PipelineConfiguration};
use crate::errors::{codes, EngineError, ErrorPayload};
use crate::events::{EngineEvent, EventKind, EventSink, NoOpEventSink};
use crate::store::Stores;
use crate::utils::{add_millis, now_utc, task_cache_key, Timestamp};

/// Result of a completion evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The run can still make progress.
    InProgress,
    /// This call moved the run to COMPLETED.
    Completed(Run),
    /// This call moved the run to FAILED.
    Failed(Run),
    /// The run was already terminal, or another caller made it so.
    Terminal(RunStatus),
}

impl CompletionOutcome {
    /// Returns true unless the run is still in progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Result of reporting a task failure.
#[derive(Debug)]
pub enum FailureOutcome {
    /// The task went back to PENDING and becomes claimable at `retry_at`.
    RetryScheduled {
        /// The updated task.
        task: Task,
        /// Earliest claim time.
        retry_at: Timestamp,
        /// The transient error that caused the retry.
        cause: EngineError,
    },
    /// The task is permanently FAILED.
    Failed {
        /// The updated task.
        task: Task,
        /// Why no retry was scheduled.
        cause: EngineError,
    },
}

impl FailureOutcome {
    /// Returns the updated task.
    #[must_use]
    pub fn task(&self) -> &Task {
        match self {
            Self::RetryScheduled { task, .. } | Self::Failed { task, .. } => task,
        }
    }

    /// Consumes the outcome, returning the updated task.
    #[must_use]
    pub fn into_task(self) -> Task {
        match self {
            Self::RetryScheduled { task, .. } | Self::Failed { task, .. } => task,
        }
    }

    /// Returns the classified error.
    #[must_use]
    pub fn cause(&self) -> &EngineError {
        match self {
            Self::RetryScheduled { cause, .. } | Self::Failed { cause, .. } => cause,
        }
    }

    /// Returns true if a retry was scheduled.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryScheduled { .. })
    }
}

/// Drives runs through their lifecycle on top of the stores.
pub struct ExecutionCoordinator {
    stores: Stores,
    provider: Arc<dyn ConfigurationProvider>,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionCoordinator {
    /// Creates a coordinator with default settings and no event sink.
    #[must_use]
    pub fn new(stores: Stores, provider: Arc<dyn ConfigurationProvider>) -> Self {
        Self {
            stores,
            provider,
            config: EngineConfig::default(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the settings.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the store handles.
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Creates a run and one PENDING task per node.
    #[tracing::instrument(skip(self, inputs, options), fields(run_id = tracing::field::Empty))]
    pub async fn start_execution(
        &self,
        pipeline_id: &str,
        user_id: &str,
        inputs: Value,
        options: RunOptions,
    ) -> Result<Run, EngineError> {
        let configuration = self
            .provider
            .load(pipeline_id)
            .await?
            .ok_or_else(|| EngineError::ConfigurationNotFound(pipeline_id.to_string()))?;
        self.check_configuration(pipeline_id, &configuration)?;

        let now = now_utc();
        let mut run = Run::new(pipeline_id, user_id, configuration, inputs, now);
        run.priority = options.priority;
        run.scheduled_for = options.scheduled_for;
        run.timeout_at = options.timeout_ms.map(|ms| add_millis(now, ms));
        run.max_retries = options
            .max_retries
            .unwrap_or(self.config.default_run_max_retries);
        run.metadata = options.metadata.clone();
        tracing::Span::current().record("run_id", tracing::field::display(run.id));

        let tasks = self.build_tasks(&run, &options, now);
        self.stores.create_run(&run, &tasks).await?;

        self.log(
            NewLogEntry::info(
                run.id,
                LogCategory::Execution,
                format!("Pipeline execution started with {} tasks", tasks.len()),
            )
            .with_metadata(json!({
                "pipeline_id": pipeline_id,
                "user_id": user_id,
                "total_tasks": tasks.len(),
            })),
        )
        .await?;

        info!(
            run_id = %run.id,
            pipeline_id = %pipeline_id,
            total_tasks = tasks.len(),
            "Run created"
        );
        self.emit(
            EngineEvent::run(EventKind::RunStarted, run.id)
                .with_data(json!({"pipeline_id": pipeline_id, "total_tasks": tasks.len()})),
        )
        .await;

        Ok(run)
    }

    /// Claims every ready task and returns them for dispatch.
    ///
    /// With nothing ready, re-evaluates completion and returns an empty list.
    #[tracing::instrument(skip(self))]
    pub async fn execute_next_tasks(&self, run_id: Uuid) -> Result<Vec<DispatchTask>, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(status = %run.status, "Run is terminal, nothing to dispatch");
            return Ok(Vec::new());
        }

        let tasks = self.stores.tasks.list_tasks(run_id).await?;
        let now = now_utc();
        let ready: Vec<Task> = ready_tasks(&tasks, now, self.config.dangling_dependencies)
            .into_iter()
            .cloned()
            .collect();

        if ready.is_empty() {
            self.evaluate_completion(run_id).await?;
            return Ok(Vec::new());
        }

        let upstream: HashMap<&str, &Task> = tasks.iter().map(|t| (t.node_id.as_str(), t)).collect();
        let mut dispatched = Vec::with_capacity(ready.len());

        for task in ready {
            let Some(claimed) = self
                .stores
                .tasks
                .transition(task.id, &TaskTransition::Claim, now)
                .await?
            else {
                debug!(task_id = %task.id, node_id = %task.node_id, "Task claimed elsewhere");
                continue;
            };

            self.log(
                NewLogEntry::info(
                    run_id,
                    LogCategory::Task,
                    format!("Task {} started", claimed.node_id),
                )
                .with_task(claimed.id)
                .with_metadata(json!({
                    "node_type": claimed.node_type,
                    "attempt": claimed.retry_count,
                })),
            )
            .await?;
            debug!(task_id = %claimed.id, node_id = %claimed.node_id, "Task claimed");
            self.emit(
                EngineEvent::task(EventKind::TaskClaimed, run_id, claimed.id)
                    .with_data(json!({"node_id": claimed.node_id, "attempt": claimed.retry_count})),
            )
            .await;

            dispatched.push(dispatch_record(&run, &claimed, &upstream));
        }

        if !dispatched.is_empty()
            && run.status == RunStatus::Queued
            && self
                .stores
                .runs
                .transition(run_id, &RunTransition::Start, now)
                .await?
                .is_some()
        {
            info!(run_id = %run_id, "Run started");
        }

        Ok(dispatched)
    }

    /// Records an executor report for a RUNNING task.
    ///
    /// A failed result is handed to [`ExecutionCoordinator::handle_task_failure`].
    /// Reporting success again for a COMPLETED task changes nothing.
    #[tracing::instrument(skip(self, result), fields(success = result.success))]
    pub async fn complete_task(&self, task_id: Uuid, result: TaskResult) -> Result<Task, EngineError> {
        if !result.success {
            let error = result.error.unwrap_or_else(ErrorPayload::unknown);
            return self
                .handle_task_failure(task_id, error)
                .await
                .map(FailureOutcome::into_task);
        }

        let task = self.get_task(task_id).await?;
        match task.status {
            TaskStatus::Completed => {
                debug!(node_id = %task.node_id, "Duplicate completion ignored");
                return Ok(task);
            }
            TaskStatus::Running => {}
            other => return Err(EngineError::invalid_task_state("complete_task", other)),
        }

        let now = now_utc();
        let transition = TaskTransition::Complete {
            outputs: result.outputs.unwrap_or(Value::Null),
            metrics: result.metrics,
            cached: result.cached,
        };
        let Some(completed) = self.stores.tasks.transition(task_id, &transition, now).await? else {
            let current = self.get_task(task_id).await?;
            if current.status == TaskStatus::Completed {
                return Ok(current);
            }
            return Err(EngineError::invalid_task_state("complete_task", current.status));
        };

        let duration_ms = completed.metrics.as_ref().map_or(0, |m| m.duration_ms);
        self.log(
            NewLogEntry::info(
                completed.run_id,
                LogCategory::Task,
                format!("Task {} completed", completed.node_id),
            )
            .with_task(completed.id)
            .with_metadata(json!({
                "duration_ms": duration_ms,
                "cached": completed.cached,
            })),
        )
        .await?;
        info!(
            run_id = %completed.run_id,
            node_id = %completed.node_id,
            duration_ms,
            cached = completed.cached,
            "Task completed"
        );
        self.emit(
            EngineEvent::task(EventKind::TaskCompleted, completed.run_id, completed.id)
                .with_data(json!({"node_id": completed.node_id, "cached": completed.cached})),
        )
        .await;

        self.evaluate_completion(completed.run_id).await?;
        Ok(completed)
    }

    /// Records a failure of a RUNNING task and either schedules a retry or fails it.
    #[tracing::instrument(skip(self, error), fields(code = %error.code))]
    pub async fn handle_task_failure(
        &self,
        task_id: Uuid,
        error: ErrorPayload,
    ) -> Result<FailureOutcome, EngineError> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(EngineError::invalid_task_state("handle_task_failure", task.status));
        }

        self.log(
            NewLogEntry::error(
                task.run_id,
                LogCategory::Error,
                format!("Task {} failed: {error}", task.node_id),
            )
            .with_task(task.id)
            .with_metadata(json!({
                "error": error,
                "attempt": task.retry_count,
            })),
        )
        .await?;

        let now = now_utc();
        match self.config.retry.decide(&task, &error) {
            RetryDecision::Retry { delay_ms } => {
                let retry_at = add_millis(now, delay_ms);
                let transition = TaskTransition::ScheduleRetry {
                    error: error.clone(),
                    next_retry_at: retry_at,
                };
                let Some(pending) = self.stores.tasks.transition(task_id, &transition, now).await?
                else {
                    let current = self.get_task(task_id).await?;
                    return Err(EngineError::invalid_task_state("handle_task_failure", current.status));
                };

                self.log(
                    NewLogEntry::warn(
                        pending.run_id,
                        LogCategory::Retry,
                        format!(
                            "Task {} scheduled for retry {}/{} in {delay_ms}ms",
                            pending.node_id, pending.retry_count, pending.max_retries
                        ),
                    )
                    .with_task(pending.id)
                    .with_metadata(json!({
                        "retry_count": pending.retry_count,
                        "delay_ms": delay_ms,
                        "next_retry_at": retry_at,
                    })),
                )
                .await?;
                warn!(
                    run_id = %pending.run_id,
                    node_id = %pending.node_id,
                    retry_count = pending.retry_count,
                    delay_ms,
                    "Task retry scheduled"
                );
                self.emit(
                    EngineEvent::task(EventKind::TaskRetryScheduled, pending.run_id, pending.id)
                        .with_data(json!({
                            "node_id": pending.node_id,
                            "retry_count": pending.retry_count,
                            "next_retry_at": retry_at,
                        })),
                )
                .await;

                Ok(FailureOutcome::RetryScheduled {
                    task: pending,
                    retry_at,
                    cause: error.into_error(true),
                })
            }
            decision => {
                let transition = TaskTransition::Fail {
                    error: error.clone(),
                };
                let Some(failed) = self.stores.tasks.transition(task_id, &transition, now).await?
                else {
                    let current = self.get_task(task_id).await?;
                    return Err(EngineError::invalid_task_state("handle_task_failure", current.status));
                };

                let exhausted = decision == RetryDecision::Exhausted;
                error!(
                    run_id = %failed.run_id,
                    node_id = %failed.node_id,
                    code = %error.code,
                    exhausted,
                    "Task failed"
                );
                self.emit(
                    EngineEvent::task(EventKind::TaskFailed, failed.run_id, failed.id).with_data(
                        json!({"node_id": failed.node_id, "code": error.code, "exhausted": exhausted}),
                    ),
                )
                .await;

                self.evaluate_completion(failed.run_id).await?;
                Ok(FailureOutcome::Failed {
                    task: failed,
                    cause: error.into_error(exhausted),
                })
            }
        }
    }

    /// Cancels a QUEUED or RUNNING run.
    ///
    /// RUNNING tasks become FAILED with a `CANCELLED` error; PENDING tasks
    /// become CANCELLED.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_execution(&self, run_id: Uuid, reason: &str) -> Result<Run, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::invalid_run_state("cancel_execution", run.status));
        }

        let now = now_utc();
        let payload = ErrorPayload::cancelled(reason);
        let transition = RunTransition::Cancel {
            error: payload.clone(),
        };
        let Some(cancelled) = self.stores.runs.transition(run_id, &transition, now).await? else {
            let current = self.get_run(run_id).await?;
            return Err(EngineError::invalid_run_state("cancel_execution", current.status));
        };

        self.log(
            NewLogEntry::warn(
                run_id,
                LogCategory::Cancellation,
                format!("Pipeline execution cancelled: {reason}"),
            )
            .with_metadata(json!({"reason": reason})),
        )
        .await?;

        let mut stopped = 0usize;
        for task in self.stores.tasks.list_tasks(run_id).await? {
            let transition = match task.status {
                TaskStatus::Running => TaskTransition::Fail {
                    error: payload.clone(),
                },
                TaskStatus::Pending | TaskStatus::Queued => TaskTransition::Cancel,
                _ => continue,
            };
            if self.stores.tasks.transition(task.id, &transition, now).await?.is_some() {
                stopped += 1;
            }
        }

        warn!(run_id = %run_id, reason, stopped_tasks = stopped, "Run cancelled");
        self.emit(
            EngineEvent::run(EventKind::RunCancelled, run_id)
                .with_data(json!({"reason": reason, "stopped_tasks": stopped})),
        )
        .await;

        Ok(cancelled)
    }

    /// Requeues a FAILED run and resets every task that did not complete.
    #[tracing::instrument(skip(self))]
    pub async fn retry_execution(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Failed {
            return Err(EngineError::invalid_run_state("retry_execution", run.status));
        }
        if run.retry_count >= run.max_retries {
            return Err(EngineError::RetryLimitExceeded {
                subject: format!("run {run_id}"),
                attempts: run.retry_count,
                max_retries: run.max_retries,
            });
        }

        let Some(failed_at) = run.completed_at else {
            return Err(EngineError::invalid_run_state("retry_execution", run.status));
        };

        let now = now_utc();
        // Tasks are reset while the run is still FAILED so that no poller can
        // evaluate the requeued run against stale failures. Both transitions
        // are pinned to this failure: a concurrent retry that already requeued
        // the run leaves nothing here to reset or requeue.
        let reset_transition = TaskTransition::Reset { failed_at };
        let mut reset = 0usize;
        for task in self.stores.tasks.list_tasks(run_id).await? {
            if task.can_apply(&reset_transition)
                && self
                    .stores
                    .tasks
                    .transition(task.id, &reset_transition, now)
                    .await?
                    .is_some()
            {
                reset += 1;
            }
        }

        let Some(requeued) = self
            .stores
            .runs
            .transition(run_id, &RunTransition::Requeue { failed_at }, now)
            .await?
        else {
            let current = self.get_run(run_id).await?;
            return Err(EngineError::invalid_run_state("retry_execution", current.status));
        };

        let summary = ProgressSummary::from_tasks(&self.stores.tasks.list_tasks(run_id).await?);
        let requeued = self
            .stores
            .runs
            .update_counts(run_id, summary.completed, summary.total, now)
            .await?
            .unwrap_or(requeued);

        self.log(
            NewLogEntry::info(
                run_id,
                LogCategory::Execution,
                format!(
                    "Pipeline execution retry {}/{}: {reset} tasks reset",
                    requeued.retry_count, requeued.max_retries
                ),
            )
            .with_metadata(json!({
                "retry_count": requeued.retry_count,
                "reset_tasks": reset,
            })),
        )
        .await?;
        info!(run_id = %run_id, retry_count = requeued.retry_count, reset_tasks = reset, "Run requeued");
        self.emit(
            EngineEvent::run(EventKind::RunRetried, run_id)
                .with_data(json!({"retry_count": requeued.retry_count, "reset_tasks": reset})),
        )
        .await;

        Ok(requeued)
    }

    /// Refreshes progress and moves the run to COMPLETED or FAILED when due.
    ///
    /// Safe to call any number of times; only the caller whose conditional
    /// update lands emits the terminal event. The failure entry is logged
    /// before the FAILED transition, so evaluators racing on the same
    /// snapshot may each write one.
    #[tracing::instrument(skip(self))]
    pub async fn evaluate_completion(&self, run_id: Uuid) -> Result<CompletionOutcome, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(CompletionOutcome::Terminal(run.status));
        }

        let tasks = self.stores.tasks.list_tasks(run_id).await?;
        let summary = ProgressSummary::from_tasks(&tasks);
        if summary.total != run.total_tasks {
            warn!(
                run_id = %run_id,
                expected = run.total_tasks,
                found = summary.total,
                "Task rows do not match the run, not evaluating"
            );
            return Ok(CompletionOutcome::InProgress);
        }

        let now = now_utc();
        if self
            .stores
            .runs
            .update_counts(run_id, summary.completed, summary.total, now)
            .await?
            .is_none()
        {
            // Terminal already, or another caller recorded a newer snapshot.
            return self.observe_terminal(run_id).await;
        }

        if summary.completed == summary.total {
            let transition = RunTransition::Complete {
                outputs: aggregate_outputs(&tasks),
            };
            let Some(completed) = self.stores.runs.transition(run_id, &transition, now).await? else {
                return self.observe_terminal(run_id).await;
            };

            self.log(
                NewLogEntry::info(run_id, LogCategory::Execution, "Pipeline execution completed")
                    .with_metadata(json!({"total_tasks": summary.total})),
            )
            .await?;
            info!(run_id = %run_id, total_tasks = summary.total, "Run completed");
            self.emit(
                EngineEvent::run(EventKind::RunCompleted, run_id)
                    .with_data(json!({"total_tasks": summary.total})),
            )
            .await;
            return Ok(CompletionOutcome::Completed(completed));
        }

        if summary.failed > 0 && !has_forward_progress(&tasks, self.config.dangling_dependencies) {
            let failed: Vec<&str> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.node_id.as_str())
                .collect();
            let payload = ErrorPayload::new(
                codes::TASK_FAILED,
                format!("{} task(s) failed: {}", failed.len(), failed.join(", ")),
            )
            .with_detail("failed_tasks", json!(failed));

            // The error entry precedes the status flip. Callers arriving after
            // the flip see a terminal run here and write nothing.
            let current = self.get_run(run_id).await?;
            if current.status.is_terminal() {
                return Ok(CompletionOutcome::Terminal(current.status));
            }
            self.log(
                NewLogEntry::error(
                    run_id,
                    LogCategory::Execution,
                    format!("Pipeline execution failed: {}", payload.message),
                )
                .with_metadata(json!({"error": payload, "retry_count": current.retry_count})),
            )
            .await?;

            let transition = RunTransition::Fail {
                error: payload.clone(),
            };
            let Some(failed_run) = self.stores.runs.transition(run_id, &transition, now).await? else {
                return self.observe_terminal(run_id).await;
            };
            error!(run_id = %run_id, failed_tasks = ?failed, "Run failed");
            self.emit(
                EngineEvent::run(EventKind::RunFailed, run_id)
                    .with_data(json!({"failed_tasks": failed})),
            )
            .await;
            return Ok(CompletionOutcome::Failed(failed_run));
        }

        Ok(CompletionOutcome::InProgress)
    }

    /// Returns a snapshot of the run, or `None` if it is unknown or unreadable.
    pub async fn get_execution_status(&self, run_id: Uuid) -> Option<ExecutionStatus> {
        match self.load_status(run_id).await {
            Ok(status) => status,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load execution status");
                None
            }
        }
    }

    /// Returns true while an executor should keep working on the task.
    pub async fn is_task_active(&self, task_id: Uuid) -> Result<bool, EngineError> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        let run = self.stores.runs.get_run(task.run_id).await?;
        Ok(run.is_some_and(|r| r.status.is_active()))
    }

    /// Loads a run.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        self.stores
            .runs
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Loads a task.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, EngineError> {
        self.stores
            .tasks
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Appends a log entry to a run's stream.
    pub async fn create_log(&self, entry: NewLogEntry) -> Result<LogEntry, EngineError> {
        self.log(entry).await
    }

    /// Returns the entries after `from_sequence`, ascending.
    pub async fn get_log_stream(
        &self,
        run_id: Uuid,
        from_sequence: u64,
    ) -> Result<Vec<LogEntry>, EngineError> {
        self.stores.logs.stream(run_id, from_sequence, None).await
    }

    async fn load_status(&self, run_id: Uuid) -> Result<Option<ExecutionStatus>, EngineError> {
        let Some(run) = self.stores.runs.get_run(run_id).await? else {
            return Ok(None);
        };
        let tasks = self.stores.tasks.list_tasks(run_id).await?;
        let recent_logs = self
            .stores
            .logs
            .recent(run_id, self.config.recent_log_limit)
            .await?;
        Ok(Some(ExecutionStatus {
            progress: ProgressSummary::from_tasks(&tasks),
            run,
            tasks,
            recent_logs,
        }))
    }

    async fn observe_terminal(&self, run_id: Uuid) -> Result<CompletionOutcome, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            Ok(CompletionOutcome::Terminal(run.status))
        } else {
            Ok(CompletionOutcome::InProgress)
        }
    }

    fn check_configuration(
        &self,
        pipeline_id: &str,
        configuration: &PipelineConfiguration,
    ) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        if let Some(dup) = configuration.nodes.iter().find(|n| !seen.insert(n.id.as_str())) {
            return Err(EngineError::InvalidConfiguration {
                pipeline_id: pipeline_id.to_string(),
                message: format!("duplicate node id '{}'", dup.id),
            });
        }

        let dangling = configuration.dangling_connections();
        if dangling.is_empty() {
            return Ok(());
        }
        let edges: Vec<String> = dangling
            .iter()
            .map(|c| format!("{} -> {}", c.source, c.target))
            .collect();

        match self.config.dangling_dependencies {
            DanglingDependencyPolicy::Reject => Err(EngineError::InvalidConfiguration {
                pipeline_id: pipeline_id.to_string(),
                message: format!("connections reference unknown nodes: {}", edges.join(", ")),
            }),
            DanglingDependencyPolicy::Satisfied => {
                warn!(
                    pipeline_id,
                    connections = ?edges,
                    "Connections reference unknown nodes; treating them as satisfied"
                );
                Ok(())
            }
        }
    }

    fn build_tasks(&self, run: &Run, options: &RunOptions, now: Timestamp) -> Vec<Task> {
        let configuration = &run.configuration;
        let order = configuration.execution_order();

        configuration
            .nodes
            .iter()
            .map(|node| {
                let mut task = Task::new(
                    run.id,
                    node.id.clone(),
                    node.node_type.clone(),
                    configuration.dependencies_of(&node.id),
                    now,
                );
                task.config = node.config.clone();
                task.execution_order = order.get(&node.id).copied().unwrap_or_default();
                task.max_retries = node
                    .max_retries
                    .or(options.task_max_retries)
                    .unwrap_or(self.config.default_task_max_retries);
                task.retry_delay_ms = node
                    .retry_delay_ms
                    .or(options.retry_delay_ms)
                    .unwrap_or(self.config.retry.base_delay_ms);
                task.cache_key = Some(task_cache_key(&node.node_type, &node.config, &run.inputs));
                task
            })
            .collect()
    }

    async fn log(&self, entry: NewLogEntry) -> Result<LogEntry, EngineError> {
        self.stores.logs.append(entry).await
    }

    async fn emit(&self, event: EngineEvent) {
        self.events.emit(&event).await;
    }
}

fn dispatch_record(run: &Run, task: &Task, upstream: &HashMap<&str, &Task>) -> DispatchTask {
    let dependencies: serde_json::Map<String, Value> = task
        .dependencies
        .iter()
        .map(|dep| {
            let outputs = upstream
                .get(dep.as_str())
                .and_then(|t| t.outputs.clone())
                .unwrap_or(Value::Null);
            (dep.clone(), outputs)
        })
        .collect();

    DispatchTask {
        id: task.id,
        run_id: run.id,
        node_id: task.node_id.clone(),
        node_type: task.node_type.clone(),
        config: task.config.clone(),
        inputs: json!({
            "pipeline": run.inputs,
            "dependencies": Value::Object(dependencies),
        }),
        attempt: task.retry_count,
        cache_key: task.cache_key.clone(),
    }
}

fn aggregate_outputs(tasks: &[Task]) -> Value {
    let mut outputs = serde_json::Map::new();
    let mut metrics = TaskMetrics::default();
    let mut cached_tasks = 0u32;

    for task in tasks {
        if let Some(task_outputs) = &task.outputs {
            outputs.insert(task.node_id.clone(), task_outputs.clone());
        }
        if let Some(task_metrics) = &task.metrics {
            metrics.accumulate(task_metrics);
        }
        if task.cached {
            cached_tasks += 1;
        }
    }

    let mut metrics = serde_json::to_value(&metrics).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut metrics {
        map.insert("cached_tasks".to_string(), json!(cached_tasks));
    }
    json!({"tasks": Value::Object(outputs), "metrics": metrics})
}
