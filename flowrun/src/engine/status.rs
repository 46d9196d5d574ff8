//! Read-only status snapshots.

use serde::{Deserialize, Serialize};

use crate::core::{compute_progress, LogEntry, Run, Task, TaskStatus};

/// Task counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    /// Number of tasks.
    pub total: u32,
    /// COMPLETED tasks.
    pub completed: u32,
    /// RUNNING tasks.
    pub running: u32,
    /// FAILED tasks.
    pub failed: u32,
    /// `completed / total` as a percentage in `[0, 100]`.
    pub percentage: f64,
}

impl ProgressSummary {
    /// Counts `tasks` by status.
    #[must_use]
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let count = |status: TaskStatus| {
            u32::try_from(tasks.iter().filter(|t| t.status == status).count()).unwrap_or(u32::MAX)
        };
        let total = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
        let completed = count(TaskStatus::Completed);
        Self {
            total,
            completed,
            running: count(TaskStatus::Running),
            failed: count(TaskStatus::Failed),
            percentage: compute_progress(completed, total) * 100.0,
        }
    }
}

/// Everything a status surface shows for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    /// The run row.
    pub run: Run,
    /// All task rows in execution order.
    pub tasks: Vec<Task>,
    /// Derived counts.
    pub progress: ProgressSummary,
    /// The most recent log entries, ascending.
    pub recent_logs: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    #[test]
    fn test_progress_summary_counts() {
        let statuses = [
            TaskStatus::Completed,
            TaskStatus::Completed,
            TaskStatus::Running,
            TaskStatus::Failed,
        ];
        let tasks: Vec<Task> = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut t = Task::new(Uuid::nil(), format!("n{i}"), "t", BTreeSet::new(), now_utc());
                t.status = *status;
                t
            })
            .collect();

        let summary = ProgressSummary::from_tasks(&tasks);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.failed, 1);
        assert!((summary.percentage - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_run_is_fully_progressed() {
        let summary = ProgressSummary::from_tasks(&[]);
        assert_eq!(summary.total, 0);
        assert!((summary.percentage - 100.0).abs() < f64::EPSILON);
    }
}
