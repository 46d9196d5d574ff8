//! Error types for the flowrun engine.
//!
//! Two layers live here: [`EngineError`], which is what every coordinator
//! and store operation returns, and [`ErrorPayload`], the structured error
//! record persisted on tasks and runs and reported by executors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{RunStatus, TaskStatus};

/// Well-known task error codes.
pub mod codes {
    /// Network-level failure talking to a dependency.
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    /// The node did not finish in time.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// An upstream rate limit was hit.
    pub const RATE_LIMIT: &str = "RATE_LIMIT";
    /// A failure the executor expects to clear on its own.
    pub const TEMPORARY_FAILURE: &str = "TEMPORARY_FAILURE";
    /// An upstream service was unavailable.
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    /// The task was cancelled while running.
    pub const CANCELLED: &str = "CANCELLED";
    /// One or more tasks failed permanently.
    pub const TASK_FAILED: &str = "TASK_FAILED";
    /// The executor reported a failure without an error payload.
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

    /// Codes retried by the default retry policy.
    pub const DEFAULT_RETRYABLE: [&str; 5] = [
        NETWORK_ERROR,
        TIMEOUT,
        RATE_LIMIT,
        TEMPORARY_FAILURE,
        SERVICE_UNAVAILABLE,
    ];
}

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A task failed with a code the retry policy considers transient.
    #[error("Transient task error [{code}]: {message}")]
    TransientTask {
        /// The error code.
        code: String,
        /// The error message.
        message: String,
    },

    /// A task failed with a code that is never retried.
    #[error("Permanent task error [{code}]: {message}")]
    PermanentTask {
        /// The error code.
        code: String,
        /// The error message.
        message: String,
    },

    /// The run does not exist.
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// The task does not exist.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// The retry budget is spent.
    #[error("Retry limit exceeded for {subject}: {attempts}/{max_retries}")]
    RetryLimitExceeded {
        /// What was being retried (run or task id).
        subject: String,
        /// Retries already performed.
        attempts: u32,
        /// Maximum retries allowed.
        max_retries: u32,
    },

    /// The operation is not valid for the current state.
    #[error("Invalid state for {operation}: {current}")]
    InvalidState {
        /// The attempted operation.
        operation: String,
        /// The current state.
        current: String,
    },

    /// The pipeline configuration could not be resolved.
    #[error("Configuration not found for pipeline: {0}")]
    ConfigurationNotFound(String),

    /// The pipeline configuration cannot be turned into tasks.
    #[error("Invalid configuration for pipeline '{pipeline_id}': {message}")]
    InvalidConfiguration {
        /// The pipeline id.
        pipeline_id: String,
        /// What is wrong.
        message: String,
    },

    /// Engine settings could not be parsed.
    #[error("Settings error: {0}")]
    Settings(String),

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Creates an invalid run state error.
    #[must_use]
    pub fn invalid_run_state(operation: impl Into<String>, status: RunStatus) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            current: format!("run is {status}"),
        }
    }

    /// Creates an invalid task state error.
    #[must_use]
    pub fn invalid_task_state(operation: impl Into<String>, status: TaskStatus) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            current: format!("task is {status}"),
        }
    }

    /// Creates a storage error from any displayable error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Returns true for errors caused by the caller rather than the engine.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound(_)
                | Self::TaskNotFound(_)
                | Self::InvalidState { .. }
                | Self::RetryLimitExceeded { .. }
                | Self::ConfigurationNotFound(_)
                | Self::InvalidConfiguration { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A structured error as persisted on tasks and runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code (e.g. `TIMEOUT`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Additional structured details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl ErrorPayload {
    /// Creates a new error payload.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// The payload written on tasks that were running when their run was cancelled.
    #[must_use]
    pub fn cancelled(reason: &str) -> Self {
        Self::new(codes::CANCELLED, "cancelled").with_detail("reason", serde_json::json!(reason))
    }

    /// The payload used when a failure report carries no error.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(codes::UNKNOWN_ERROR, "task reported failure without an error")
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Converts into the matching engine error.
    #[must_use]
    pub fn into_error(self, retryable: bool) -> EngineError {
        if retryable {
            EngineError::TransientTask {
                code: self.code,
                message: self.message,
            }
        } else {
            EngineError::PermanentTask {
                code: self.code,
                message: self.message,
            }
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::Value::String(self.code.clone()));
        map.insert("message".to_string(), serde_json::Value::String(self.message.clone()));
        if !self.details.is_empty() {
            let details: serde_json::Map<String, serde_json::Value> = self
                .details
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.insert("details".to_string(), serde_json::Value::Object(details));
        }
        map
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
