//! The run record and its state transitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RunStatus;
use crate::definition::PipelineConfiguration;
use crate::errors::ErrorPayload;
use crate::utils::{generate_uuid_v7, Timestamp};

/// One execution instance of a pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id.
    pub id: Uuid,
    /// Pipeline the run was started from.
    pub pipeline_id: String,
    /// User who started the run.
    pub user_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Configuration snapshot taken at start.
    pub configuration: PipelineConfiguration,
    /// Caller-supplied inputs.
    pub inputs: serde_json::Value,
    /// Aggregated outputs, set on completion.
    pub outputs: Option<serde_json::Value>,
    /// `completed_tasks / total_tasks`.
    pub progress: f64,
    /// Number of task rows.
    pub total_tasks: u32,
    /// Number of COMPLETED task rows.
    pub completed_tasks: u32,
    /// Number of explicit run retries performed.
    pub retry_count: u32,
    /// Maximum explicit run retries.
    pub max_retries: u32,
    /// Scheduling priority, higher first.
    pub priority: i32,
    /// Earliest time the run should be picked up.
    pub scheduled_for: Option<Timestamp>,
    /// Deadline enforced by the external reaper.
    pub timeout_at: Option<Timestamp>,
    /// Failure or cancellation payload.
    pub error: Option<ErrorPayload>,
    /// Free-form caller metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the run was (re)queued.
    pub queued_at: Timestamp,
    /// When the first task was claimed.
    pub started_at: Option<Timestamp>,
    /// When the run reached a terminal state.
    pub completed_at: Option<Timestamp>,
    /// Last mutation time.
    pub last_update_at: Timestamp,
}

/// A conditional status change applied to a run by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum RunTransition {
    /// QUEUED → RUNNING on first dispatch.
    Start,
    /// → COMPLETED with aggregated outputs.
    Complete {
        /// Aggregated outputs.
        outputs: serde_json::Value,
    },
    /// → FAILED.
    Fail {
        /// Why the run failed.
        error: ErrorPayload,
    },
    /// → CANCELLED.
    Cancel {
        /// Cancellation payload.
        error: ErrorPayload,
    },
    /// FAILED → QUEUED via an explicit retry.
    ///
    /// Only lands on the failure the caller observed: a run that was requeued
    /// and failed again since has a different `completed_at`.
    Requeue {
        /// `completed_at` of the observed failure.
        failed_at: Timestamp,
    },
}

impl RunTransition {
    /// Returns the status the run ends up in.
    #[must_use]
    pub fn target(&self) -> RunStatus {
        match self {
            Self::Start => RunStatus::Running,
            Self::Complete { .. } => RunStatus::Completed,
            Self::Fail { .. } => RunStatus::Failed,
            Self::Cancel { .. } => RunStatus::Cancelled,
            Self::Requeue { .. } => RunStatus::Queued,
        }
    }

    /// Returns the statuses this transition may start from.
    #[must_use]
    pub fn allowed_from(&self) -> &'static [RunStatus] {
        match self {
            Self::Start => &[RunStatus::Queued],
            Self::Complete { .. } | Self::Fail { .. } | Self::Cancel { .. } => {
                &[RunStatus::Queued, RunStatus::Running]
            }
            Self::Requeue { .. } => &[RunStatus::Failed],
        }
    }

    /// Returns a short name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Cancel { .. } => "cancel",
            Self::Requeue { .. } => "requeue",
        }
    }
}

impl Run {
    /// Creates a queued run.
    #[must_use]
    pub fn new(
        pipeline_id: impl Into<String>,
        user_id: impl Into<String>,
        configuration: PipelineConfiguration,
        inputs: serde_json::Value,
        now: Timestamp,
    ) -> Self {
        let total_tasks = u32::try_from(configuration.nodes.len()).unwrap_or(u32::MAX);
        Self {
            id: generate_uuid_v7(),
            pipeline_id: pipeline_id.into(),
            user_id: user_id.into(),
            status: RunStatus::Queued,
            configuration,
            inputs,
            outputs: None,
            progress: 0.0,
            total_tasks,
            completed_tasks: 0,
            retry_count: 0,
            max_retries: 0,
            priority: 0,
            scheduled_for: None,
            timeout_at: None,
            error: None,
            metadata: serde_json::Value::Null,
            queued_at: now,
            started_at: None,
            completed_at: None,
            last_update_at: now,
        }
    }

    /// Returns true if `transition` may be applied to the current state.
    #[must_use]
    pub fn can_apply(&self, transition: &RunTransition) -> bool {
        if !transition.allowed_from().contains(&self.status) {
            return false;
        }
        match transition {
            RunTransition::Requeue { failed_at } => self.completed_at == Some(*failed_at),
            _ => true,
        }
    }

    /// Returns true if a count refresh of `completed` tasks may overwrite this row.
    ///
    /// Terminal runs keep the counts their final transition wrote, and
    /// completed tasks never leave COMPLETED, so a lower count is stale.
    #[must_use]
    pub fn accepts_counts(&self, completed: u32) -> bool {
        !self.status.is_terminal() && completed >= self.completed_tasks
    }

    /// Applies a transition in place.
    ///
    /// Callers check [`Run::can_apply`] under the same lock or compare-and-swap
    /// that persists the result.
    pub fn apply(&mut self, transition: &RunTransition, now: Timestamp) {
        match transition {
            RunTransition::Start => {
                self.started_at.get_or_insert(now);
            }
            RunTransition::Complete { outputs } => {
                self.outputs = Some(outputs.clone());
                self.error = None;
                self.completed_tasks = self.total_tasks;
                self.progress = 1.0;
                self.completed_at = Some(now);
            }
            RunTransition::Fail { error } | RunTransition::Cancel { error } => {
                self.error = Some(error.clone());
                self.completed_at = Some(now);
            }
            RunTransition::Requeue { .. } => {
                self.retry_count = self.retry_count.saturating_add(1);
                self.outputs = None;
                self.error = None;
                self.started_at = None;
                self.completed_at = None;
                self.queued_at = now;
            }
        }
        self.status = transition.target();
        self.last_update_at = now;
    }

    /// Records fresh task counts and recomputes progress from them.
    pub fn set_counts(&mut self, completed: u32, total: u32, now: Timestamp) {
        self.completed_tasks = completed;
        self.total_tasks = total;
        self.progress = compute_progress(completed, total);
        self.last_update_at = now;
    }
}

/// Returns `completed / total`, clamped to `[0, 1]`.
///
/// A run with no tasks has nothing left to do and reports full progress.
#[must_use]
pub fn compute_progress(completed: u32, total: u32) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (f64::from(completed) / f64::from(total)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeDefinition;
    use crate::utils::now_utc;

    fn run() -> Run {
        let config = PipelineConfiguration::new()
            .node(NodeDefinition::new("a", "t"))
            .node(NodeDefinition::new("b", "t"));
        Run::new("p", "u", config, serde_json::json!({}), now_utc())
    }

    #[test]
    fn test_new_run_is_queued() {
        let run = run();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.total_tasks, 2);
        assert_eq!(run.progress, 0.0);
    }

    #[test]
    fn test_forward_only_transitions() {
        let mut run = run();
        assert!(run.can_apply(&RunTransition::Start));
        run.apply(&RunTransition::Start, now_utc());
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        assert!(!run.can_apply(&RunTransition::Start));
        assert!(!run.can_apply(&RunTransition::Requeue { failed_at: now_utc() }));

        let done = RunTransition::Complete { outputs: serde_json::json!({}) };
        run.apply(&done, now_utc());
        assert!(!run.can_apply(&done));
        assert_eq!(run.completed_tasks, 2);
        assert_eq!(run.progress, 1.0);
        assert!(!run.can_apply(&RunTransition::Fail { error: ErrorPayload::unknown() }));
    }

    #[test]
    fn test_requeue_resets_failure() {
        let mut run = run();
        run.apply(&RunTransition::Fail { error: ErrorPayload::unknown() }, now_utc());
        let failed_at = run.completed_at.unwrap();
        assert!(run.can_apply(&RunTransition::Requeue { failed_at }));

        run.apply(&RunTransition::Requeue { failed_at }, now_utc());
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.retry_count, 1);
        assert!(run.error.is_none());
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn test_requeue_only_lands_on_observed_failure() {
        let mut run = run();
        let first = now_utc();
        run.apply(&RunTransition::Fail { error: ErrorPayload::unknown() }, first);
        run.apply(&RunTransition::Requeue { failed_at: first }, now_utc());

        let second = first + chrono::Duration::seconds(1);
        run.apply(&RunTransition::Fail { error: ErrorPayload::unknown() }, second);
        assert!(!run.can_apply(&RunTransition::Requeue { failed_at: first }));
        assert!(run.can_apply(&RunTransition::Requeue { failed_at: second }));
    }

    #[test]
    fn test_counts_never_regress() {
        let mut run = run();
        assert!(run.accepts_counts(0));
        run.set_counts(1, 2, now_utc());
        assert!(!run.accepts_counts(0));
        assert!(run.accepts_counts(1));

        run.apply(&RunTransition::Complete { outputs: serde_json::json!({}) }, now_utc());
        assert!(!run.accepts_counts(2));
    }

    #[test]
    fn test_compute_progress() {
        assert_eq!(compute_progress(0, 4), 0.0);
        assert_eq!(compute_progress(1, 4), 0.25);
        assert_eq!(compute_progress(3, 3), 1.0);
        assert_eq!(compute_progress(0, 0), 1.0);
        assert_eq!(compute_progress(5, 3), 1.0);
    }
}
