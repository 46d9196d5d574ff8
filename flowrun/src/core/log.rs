//! Sequence-numbered log entries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{LogCategory, LogLevel};
use crate::utils::Timestamp;

/// A persisted log entry. `sequence_number` starts at 1 per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Task the entry is about, if any.
    pub task_id: Option<Uuid>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Engine area that wrote the entry.
    pub category: LogCategory,
    /// Per-run monotonic sequence number.
    pub sequence_number: u64,
    /// Write time.
    pub timestamp: Timestamp,
    /// Structured context.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A log entry before the store assigns its id and sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    /// Owning run.
    pub run_id: Uuid,
    /// Task the entry is about, if any.
    pub task_id: Option<Uuid>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Engine area writing the entry.
    pub category: LogCategory,
    /// Structured context.
    pub metadata: serde_json::Value,
}

impl NewLogEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            task_id: None,
            level,
            message: message.into(),
            category,
            metadata: serde_json::Value::Null,
        }
    }

    /// Creates an INFO entry.
    #[must_use]
    pub fn info(run_id: Uuid, category: LogCategory, message: impl Into<String>) -> Self {
        Self::new(run_id, LogLevel::Info, category, message)
    }

    /// Creates a WARN entry.
    #[must_use]
    pub fn warn(run_id: Uuid, category: LogCategory, message: impl Into<String>) -> Self {
        Self::new(run_id, LogLevel::Warn, category, message)
    }

    /// Creates an ERROR entry.
    #[must_use]
    pub fn error(run_id: Uuid, category: LogCategory, message: impl Into<String>) -> Self {
        Self::new(run_id, LogLevel::Error, category, message)
    }

    /// Attaches a task id.
    #[must_use]
    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materializes the entry with the id and sequence number chosen by a store.
    #[must_use]
    pub fn into_entry(self, id: Uuid, sequence_number: u64, timestamp: Timestamp) -> LogEntry {
        LogEntry {
            id,
            run_id: self.run_id,
            task_id: self.task_id,
            level: self.level,
            message: self.message,
            category: self.category,
            sequence_number,
            timestamp,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;

    #[test]
    fn test_new_log_entry_builders() {
        let run_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let entry = NewLogEntry::warn(run_id, LogCategory::Retry, "retrying")
            .with_task(task_id)
            .with_metadata(serde_json::json!({"attempt": 1}));

        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.task_id, Some(task_id));

        let stored = entry.into_entry(Uuid::nil(), 7, now_utc());
        assert_eq!(stored.sequence_number, 7);
        assert_eq!(stored.metadata["attempt"], 1);
        assert_eq!(stored.category, LogCategory::Retry);
    }
}
