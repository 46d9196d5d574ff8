//! Lifecycle events emitted by the coordinator.
//!
//! Events are a side channel for observers; the persisted log remains the
//! record of what happened. Emission never fails an engine operation.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;
use uuid::Uuid;

use crate::utils::{now_utc, Timestamp};

/// The kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A run was created.
    #[serde(rename = "run.started")]
    RunStarted,
    /// A task was claimed for dispatch.
    #[serde(rename = "task.claimed")]
    TaskClaimed,
    /// A task completed.
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// A transient failure was scheduled for retry.
    #[serde(rename = "task.retry_scheduled")]
    TaskRetryScheduled,
    /// A task failed permanently.
    #[serde(rename = "task.failed")]
    TaskFailed,
    /// A run completed.
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// A run failed.
    #[serde(rename = "run.failed")]
    RunFailed,
    /// A run was cancelled.
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    /// A failed run was requeued.
    #[serde(rename = "run.retried")]
    RunRetried,
}

impl EventKind {
    /// Returns the dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::TaskClaimed => "task.claimed",
            Self::TaskCompleted => "task.completed",
            Self::TaskRetryScheduled => "task.retry_scheduled",
            Self::TaskFailed => "task.failed",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunCancelled => "run.cancelled",
            Self::RunRetried => "run.retried",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Run the event belongs to.
    pub run_id: Uuid,
    /// Task the event is about, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    /// Event-specific payload.
    pub data: serde_json::Value,
    /// When the event was created.
    pub timestamp: Timestamp,
}

impl EngineEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn run(kind: EventKind, run_id: Uuid) -> Self {
        Self {
            kind,
            run_id,
            task_id: None,
            data: serde_json::Value::Null,
            timestamp: now_utc(),
        }
    }

    /// Creates a task-level event.
    #[must_use]
    pub fn task(kind: EventKind, run_id: Uuid, task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::run(kind, run_id)
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
