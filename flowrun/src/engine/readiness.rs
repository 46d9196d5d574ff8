//! Dependency readiness over a freshly loaded task list.
//!
//! Nothing here is cached: callers load the run's tasks from the store and
//! pass them in on every poll.

use std::collections::HashMap;

use super::config::DanglingDependencyPolicy;
use crate::core::{Task, TaskStatus};
use crate::utils::Timestamp;

/// Node id to task lookup for one run.
#[derive(Debug)]
pub struct TaskIndex<'a> {
    by_node: HashMap<&'a str, &'a Task>,
    dangling: DanglingDependencyPolicy,
}

impl<'a> TaskIndex<'a> {
    /// Indexes `tasks` by node id.
    #[must_use]
    pub fn new(tasks: &'a [Task], dangling: DanglingDependencyPolicy) -> Self {
        Self {
            by_node: tasks.iter().map(|t| (t.node_id.as_str(), t)).collect(),
            dangling,
        }
    }

    /// Returns the task for `node_id`.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&'a Task> {
        self.by_node.get(node_id).copied()
    }

    /// Returns true if every dependency of `task` is COMPLETED.
    #[must_use]
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| match self.by_node.get(dep.as_str()) {
            Some(upstream) => upstream.status == TaskStatus::Completed,
            None => self.dangling == DanglingDependencyPolicy::Satisfied,
        })
    }

    /// Returns true if `task` may be claimed at `now`.
    #[must_use]
    pub fn is_ready(&self, task: &Task, now: Timestamp) -> bool {
        task.status == TaskStatus::Pending
            && !task.is_backing_off(now)
            && self.dependencies_satisfied(task)
    }

    /// Returns true if `task` will become claimable without outside help.
    ///
    /// Unlike [`TaskIndex::is_ready`] this ignores retry backoff.
    #[must_use]
    pub fn can_progress(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending && self.dependencies_satisfied(task)
    }
}

/// Returns the tasks claimable at `now`, in execution order.
#[must_use]
pub fn ready_tasks(tasks: &[Task], now: Timestamp, dangling: DanglingDependencyPolicy) -> Vec<&Task> {
    let index = TaskIndex::new(tasks, dangling);
    let mut ready: Vec<&Task> = tasks.iter().filter(|t| index.is_ready(t, now)).collect();
    ready.sort_by(|a, b| {
        a.execution_order
            .cmp(&b.execution_order)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    ready
}

/// Returns true if some task is ready now or waiting out a retry backoff.
#[must_use]
pub fn has_forward_progress(tasks: &[Task], dangling: DanglingDependencyPolicy) -> bool {
    let index = TaskIndex::new(tasks, dangling);
    tasks.iter().any(|t| index.can_progress(t))
}
