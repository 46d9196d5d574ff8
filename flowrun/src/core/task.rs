//! Task records, executor results, and dispatch payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::TaskStatus;
use crate::errors::ErrorPayload;
use crate::utils::{generate_uuid_v7, Timestamp};

/// The execution record for one pipeline node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Node id from the configuration snapshot.
    pub node_id: String,
    /// Node type understood by the executor.
    pub node_type: String,
    /// Node config snapshot.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Current status.
    pub status: TaskStatus,
    /// Node ids that must be COMPLETED first.
    pub dependencies: BTreeSet<String>,
    /// Position in a dependency-respecting order.
    pub execution_order: u32,
    /// Retries scheduled so far.
    pub retry_count: u32,
    /// Maximum retries for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_delay_ms: u64,
    /// Earliest time a scheduled retry may be claimed.
    pub next_retry_at: Option<Timestamp>,
    /// Outputs reported on success.
    pub outputs: Option<serde_json::Value>,
    /// Metrics from the last report.
    pub metrics: Option<TaskMetrics>,
    /// Last reported error.
    pub error: Option<ErrorPayload>,
    /// Progress in `[0, 1]`.
    pub progress: f64,
    /// Key identifying equivalent invocations.
    pub cache_key: Option<String>,
    /// Whether the outputs came from a cache.
    pub cached: bool,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last claim time.
    pub started_at: Option<Timestamp>,
    /// Terminal transition time.
    pub completed_at: Option<Timestamp>,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

/// A conditional status change applied to a task by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    /// PENDING → RUNNING.
    Claim,
    /// RUNNING → COMPLETED.
    Complete {
        /// Reported outputs.
        outputs: serde_json::Value,
        /// Reported metrics.
        metrics: TaskMetrics,
        /// Whether the executor served the result from cache.
        cached: bool,
    },
    /// RUNNING → PENDING with a future eligibility time.
    ScheduleRetry {
        /// The transient error that triggered the retry.
        error: ErrorPayload,
        /// Earliest claim time.
        next_retry_at: Timestamp,
    },
    /// → FAILED.
    Fail {
        /// Final error.
        error: ErrorPayload,
    },
    /// PENDING → CANCELLED.
    Cancel,
    /// FAILED/CANCELLED/orphaned RUNNING → PENDING for a run retry.
    ///
    /// Only tasks whose last attempt was claimed no later than the run
    /// failure are reset; a later claim belongs to a newer attempt.
    Reset {
        /// `completed_at` of the failed run being retried.
        failed_at: Timestamp,
    },
}

impl TaskTransition {
    /// Returns the status the task ends up in.
    #[must_use]
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Claim => TaskStatus::Running,
            Self::Complete { .. } => TaskStatus::Completed,
            Self::ScheduleRetry { .. } | Self::Reset { .. } => TaskStatus::Pending,
            Self::Fail { .. } => TaskStatus::Failed,
            Self::Cancel => TaskStatus::Cancelled,
        }
    }

    /// Returns the statuses this transition may start from.
    #[must_use]
    pub fn allowed_from(&self) -> &'static [TaskStatus] {
        match self {
            Self::Claim => &[TaskStatus::Pending],
            Self::Complete { .. } | Self::ScheduleRetry { .. } | Self::Fail { .. } => {
                &[TaskStatus::Running]
            }
            Self::Cancel => &[TaskStatus::Pending, TaskStatus::Queued],
            Self::Reset { .. } => &[TaskStatus::Failed, TaskStatus::Cancelled, TaskStatus::Running],
        }
    }

    /// Returns a short name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Complete { .. } => "complete",
            Self::ScheduleRetry { .. } => "schedule_retry",
            Self::Fail { .. } => "fail",
            Self::Cancel => "cancel",
            Self::Reset { .. } => "reset",
        }
    }
}

impl Task {
    /// Creates a pending task for a node.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        dependencies: BTreeSet<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: generate_uuid_v7(),
            run_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            config: serde_json::Value::Null,
            status: TaskStatus::Pending,
            dependencies,
            execution_order: 0,
            retry_count: 0,
            max_retries: 0,
            retry_delay_ms: 0,
            next_retry_at: None,
            outputs: None,
            metrics: None,
            error: None,
            progress: 0.0,
            cache_key: None,
            cached: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Returns true if `transition` may be applied to the current state.
    #[must_use]
    pub fn can_apply(&self, transition: &TaskTransition) -> bool {
        if !transition.allowed_from().contains(&self.status) {
            return false;
        }
        match transition {
            TaskTransition::Reset { failed_at } => !self.started_at.is_some_and(|at| at > *failed_at),
            _ => true,
        }
    }

    /// Returns true if a scheduled retry is still in its backoff window.
    #[must_use]
    pub fn is_backing_off(&self, now: Timestamp) -> bool {
        self.next_retry_at.is_some_and(|at| at > now)
    }

    /// Applies a transition in place.
    pub fn apply(&mut self, transition: &TaskTransition, now: Timestamp) {
        match transition {
            TaskTransition::Claim => {
                self.started_at = Some(now);
                self.next_retry_at = None;
            }
            TaskTransition::Complete {
                outputs,
                metrics,
                cached,
            } => {
                self.outputs = Some(outputs.clone());
                self.metrics = Some(metrics.clone());
                self.cached = *cached;
                self.error = None;
                self.progress = 1.0;
                self.completed_at = Some(now);
            }
            TaskTransition::ScheduleRetry {
                error,
                next_retry_at,
            } => {
                self.retry_count = self.retry_count.saturating_add(1);
                self.next_retry_at = Some(*next_retry_at);
                self.error = Some(error.clone());
                self.progress = 0.0;
            }
            TaskTransition::Fail { error } => {
                self.error = Some(error.clone());
                self.completed_at = Some(now);
            }
            TaskTransition::Cancel => {
                self.completed_at = Some(now);
            }
            TaskTransition::Reset { .. } => {
                self.retry_count = 0;
                self.outputs = None;
                self.metrics = None;
                self.error = None;
                self.progress = 0.0;
                self.next_retry_at = None;
                self.started_at = None;
                self.completed_at = None;
                self.cached = false;
            }
        }
        self.status = transition.target();
        self.updated_at = now;
    }
}

/// Resource usage reported by the executor for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Wall time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Model tokens consumed.
    #[serde(default)]
    pub tokens_used: u64,
    /// Monetary cost.
    #[serde(default)]
    pub cost: f64,
    /// Peak memory in bytes.
    #[serde(default)]
    pub memory_usage: u64,
    /// CPU time in milliseconds.
    #[serde(default)]
    pub cpu_time_ms: u64,
}

impl TaskMetrics {
    /// Creates metrics with only a duration.
    #[must_use]
    pub fn with_duration_ms(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            ..Self::default()
        }
    }

    /// Adds another attempt's metrics into this one.
    pub fn accumulate(&mut self, other: &Self) {
        self.duration_ms = self.duration_ms.saturating_add(other.duration_ms);
        self.tokens_used = self.tokens_used.saturating_add(other.tokens_used);
        self.cost += other.cost;
        self.memory_usage = self.memory_usage.max(other.memory_usage);
        self.cpu_time_ms = self.cpu_time_ms.saturating_add(other.cpu_time_ms);
    }
}

/// What an executor reports after running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the node succeeded.
    pub success: bool,
    /// Outputs on success.
    #[serde(default)]
    pub outputs: Option<serde_json::Value>,
    /// Error on failure.
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    /// Resource usage.
    #[serde(default)]
    pub metrics: TaskMetrics,
    /// Whether the result was served from cache.
    #[serde(default)]
    pub cached: bool,
}

impl TaskResult {
    /// A successful result.
    #[must_use]
    pub fn success(outputs: serde_json::Value) -> Self {
        Self {
            success: true,
            outputs: Some(outputs),
            error: None,
            metrics: TaskMetrics::default(),
            cached: false,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(error: ErrorPayload) -> Self {
        Self {
            success: false,
            outputs: None,
            error: Some(error),
            metrics: TaskMetrics::default(),
            cached: false,
        }
    }

    /// Sets the metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: TaskMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Marks the result as served from cache.
    #[must_use]
    pub fn from_cache(mut self) -> Self {
        self.cached = true;
        self
    }
}

/// A claimed task handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTask {
    /// Task id to report back against.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Node id.
    pub node_id: String,
    /// Node type.
    pub node_type: String,
    /// Node config snapshot.
    pub config: serde_json::Value,
    /// `{"pipeline": run inputs, "dependencies": {node_id: outputs}}`.
    pub inputs: serde_json::Value,
    /// Zero for the first attempt.
    pub attempt: u32,
    /// Cache key for the invocation.
    pub cache_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;
    use crate::utils::{add_millis, now_utc};

    fn task() -> Task {
        Task::new(Uuid::nil(), "a", "noop", BTreeSet::new(), now_utc())
    }

    #[test]
    fn test_claim_only_from_pending() {
        let mut t = task();
        assert!(t.can_apply(&TaskTransition::Claim));
        t.apply(&TaskTransition::Claim, now_utc());
        assert_eq!(t.status, TaskStatus::Running);
        assert!(!t.can_apply(&TaskTransition::Claim));
    }

    #[test]
    fn test_schedule_retry_bumps_count() {
        let mut t = task();
        t.apply(&TaskTransition::Claim, now_utc());

        let now = now_utc();
        let at = add_millis(now, 500);
        t.apply(
            &TaskTransition::ScheduleRetry {
                error: ErrorPayload::new(codes::TIMEOUT, "slow"),
                next_retry_at: at,
            },
            now,
        );
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert!(t.is_backing_off(now));
        assert!(!t.is_backing_off(add_millis(now, 501)));
    }

    #[test]
    fn test_reset_reclaims_orphaned_running_task() {
        let claimed = now_utc();
        let mut t = task();
        t.apply(&TaskTransition::Claim, claimed);
        let reset = TaskTransition::Reset { failed_at: add_millis(claimed, 10) };
        assert!(t.can_apply(&reset));
        t.apply(&reset, now_utc());
        assert_eq!(t.status, TaskStatus::Pending);

        assert!(!t.can_apply(&reset));
    }

    #[test]
    fn test_reset_skips_task_claimed_after_failure() {
        let failed_at = now_utc();
        let mut t = task();
        t.apply(&TaskTransition::Claim, add_millis(failed_at, 5));
        assert!(!t.can_apply(&TaskTransition::Reset { failed_at }));

        t.apply(&TaskTransition::Fail { error: ErrorPayload::unknown() }, add_millis(failed_at, 9));
        assert!(!t.can_apply(&TaskTransition::Reset { failed_at }));
    }

    #[test]
    fn test_reset_covers_orphan_that_failed_late() {
        let claimed = now_utc();
        let failed_at = add_millis(claimed, 5);
        let mut t = task();
        t.apply(&TaskTransition::Claim, claimed);
        t.apply(&TaskTransition::Fail { error: ErrorPayload::unknown() }, add_millis(claimed, 20));
        assert!(t.can_apply(&TaskTransition::Reset { failed_at }));
    }

    #[test]
    fn test_reset_clears_results() {
        let mut t = task();
        t.apply(&TaskTransition::Claim, now_utc());
        t.apply(&TaskTransition::Fail { error: ErrorPayload::unknown() }, now_utc());
        let reset = TaskTransition::Reset { failed_at: now_utc() };
        assert!(t.can_apply(&reset));

        t.apply(&reset, now_utc());
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.error.is_none());
        assert!(t.outputs.is_none());
        assert_eq!(t.progress, 0.0);
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn test_complete_sets_progress() {
        let mut t = task();
        t.apply(&TaskTransition::Claim, now_utc());
        t.apply(
            &TaskTransition::Complete {
                outputs: serde_json::json!({"ok": true}),
                metrics: TaskMetrics::with_duration_ms(12),
                cached: true,
            },
            now_utc(),
        );
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 1.0);
        assert!(t.cached);
        assert!(!t.can_apply(&TaskTransition::Fail { error: ErrorPayload::unknown() }));
    }

    #[test]
    fn test_metrics_accumulate() {
        let mut total = TaskMetrics::default();
        total.accumulate(&TaskMetrics {
            duration_ms: 10,
            tokens_used: 5,
            cost: 0.5,
            memory_usage: 100,
            cpu_time_ms: 3,
        });
        total.accumulate(&TaskMetrics {
            duration_ms: 20,
            tokens_used: 1,
            cost: 0.25,
            memory_usage: 50,
            cpu_time_ms: 4,
        });
        assert_eq!(total.duration_ms, 30);
        assert_eq!(total.tokens_used, 6);
        assert_eq!(total.cost, 0.75);
        assert_eq!(total.memory_usage, 100);
        assert_eq!(total.cpu_time_ms, 7);
    }

    #[test]
    fn test_task_result_deserialize_defaults() {
        let result: TaskResult = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(result.success);
        assert_eq!(result.metrics, TaskMetrics::default());
        assert!(!result.cached);
    }
}
