//! Engine settings and per-run options.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::retry::{BackoffStrategy, RetryPolicy};
use crate::errors::EngineError;
use crate::utils::Timestamp;

/// What to do with a connection that names a node missing from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DanglingDependencyPolicy {
    /// Refuse to start the run.
    #[default]
    Reject,
    /// Start the run and treat the missing node as completed.
    Satisfied,
}

impl FromStr for DanglingDependencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "satisfied" => Ok(Self::Satisfied),
            other => Err(format!("unknown dangling dependency policy: {other}")),
        }
    }
}

fn default_task_max_retries() -> u32 {
    3
}

fn default_run_max_retries() -> u32 {
    3
}

fn default_recent_log_limit() -> usize {
    50
}

/// Coordinator-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Task retry classification and backoff.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Retry budget for tasks whose node does not set one.
    #[serde(default = "default_task_max_retries")]
    pub default_task_max_retries: u32,
    /// Budget for explicit run retries.
    #[serde(default = "default_run_max_retries")]
    pub default_run_max_retries: u32,
    /// Number of log entries included in a status snapshot.
    #[serde(default = "default_recent_log_limit")]
    pub recent_log_limit: usize,
    /// Handling of connections to unknown nodes.
    #[serde(default)]
    pub dangling_dependencies: DanglingDependencyPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_task_max_retries: default_task_max_retries(),
            default_run_max_retries: default_run_max_retries(),
            recent_log_limit: default_recent_log_limit(),
            dangling_dependencies: DanglingDependencyPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default task retry budget.
    #[must_use]
    pub fn with_default_task_max_retries(mut self, max_retries: u32) -> Self {
        self.default_task_max_retries = max_retries;
        self
    }

    /// Sets the default run retry budget.
    #[must_use]
    pub fn with_default_run_max_retries(mut self, max_retries: u32) -> Self {
        self.default_run_max_retries = max_retries;
        self
    }

    /// Sets the status snapshot log limit.
    #[must_use]
    pub fn with_recent_log_limit(mut self, limit: usize) -> Self {
        self.recent_log_limit = limit;
        self
    }

    /// Sets the dangling dependency policy.
    #[must_use]
    pub fn with_dangling_dependencies(mut self, policy: DanglingDependencyPolicy) -> Self {
        self.dangling_dependencies = policy;
        self
    }

    /// Reads overrides from `FLOWRUN_*` environment variables.
    ///
    /// Recognized: `FLOWRUN_TASK_MAX_RETRIES`, `FLOWRUN_RUN_MAX_RETRIES`,
    /// `FLOWRUN_RECENT_LOG_LIMIT`, `FLOWRUN_RETRY_BASE_DELAY_MS`,
    /// `FLOWRUN_RETRY_MAX_DELAY_MS`, `FLOWRUN_RETRY_BACKOFF`,
    /// `FLOWRUN_RETRYABLE_CODES` (comma separated), and
    /// `FLOWRUN_DANGLING_DEPENDENCIES`.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parsed(&lookup, "FLOWRUN_TASK_MAX_RETRIES")? {
            config.default_task_max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "FLOWRUN_RUN_MAX_RETRIES")? {
            config.default_run_max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "FLOWRUN_RECENT_LOG_LIMIT")? {
            config.recent_log_limit = v;
        }
        if let Some(v) = parsed(&lookup, "FLOWRUN_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = parsed(&lookup, "FLOWRUN_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay_ms = Some(v);
        }
        if let Some(v) = parsed::<BackoffStrategy, _>(&lookup, "FLOWRUN_RETRY_BACKOFF")? {
            config.retry.backoff = v;
        }
        if let Some(v) = parsed(&lookup, "FLOWRUN_DANGLING_DEPENDENCIES")? {
            config.dangling_dependencies = v;
        }
        if let Some(raw) = lookup("FLOWRUN_RETRYABLE_CODES") {
            config.retry.retryable_codes = raw
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>, EngineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| EngineError::Settings(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

/// Per-run options passed to `start_execution`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Scheduling priority, higher first.
    #[serde(default)]
    pub priority: i32,
    /// Earliest pickup time.
    #[serde(default)]
    pub scheduled_for: Option<Timestamp>,
    /// Run deadline in milliseconds from start.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Explicit run retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Task retry budget for nodes without their own.
    #[serde(default)]
    pub task_max_retries: Option<u32>,
    /// Base retry delay for nodes without their own.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Free-form metadata stored on the run.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RunOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the earliest pickup time.
    #[must_use]
    pub fn with_scheduled_for(mut self, at: Timestamp) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Sets the run deadline relative to start.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the run retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the task retry budget.
    #[must_use]
    pub fn with_task_max_retries(mut self, max_retries: u32) -> Self {
        self.task_max_retries = Some(max_retries);
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }

    /// Sets run metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_task_max_retries, 3);
        assert_eq!(config.default_run_max_retries, 3);
        assert_eq!(config.recent_log_limit, 50);
        assert_eq!(config.dangling_dependencies, DanglingDependencyPolicy::Reject);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"recent_log_limit": 5, "dangling_dependencies": "satisfied"}"#)
                .unwrap();
        assert_eq!(config.recent_log_limit, 5);
        assert_eq!(config.default_task_max_retries, 3);
        assert_eq!(config.dangling_dependencies, DanglingDependencyPolicy::Satisfied);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_from_lookup() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("FLOWRUN_TASK_MAX_RETRIES", "5"),
            ("FLOWRUN_RETRY_BASE_DELAY_MS", " 250 "),
            ("FLOWRUN_RETRY_MAX_DELAY_MS", "4000"),
            ("FLOWRUN_RETRY_BACKOFF", "linear"),
            ("FLOWRUN_RETRYABLE_CODES", "TIMEOUT, FLAKY,"),
            ("FLOWRUN_DANGLING_DEPENDENCIES", "satisfied"),
        ]))
        .unwrap();

        assert_eq!(config.default_task_max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, Some(4000));
        assert_eq!(config.retry.backoff, BackoffStrategy::Linear);
        assert!(config.retry.is_retryable("FLAKY"));
        assert!(!config.retry.is_retryable("RATE_LIMIT"));
        assert_eq!(config.retry.retryable_codes.len(), 2);
        assert_eq!(config.dangling_dependencies, DanglingDependencyPolicy::Satisfied);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = EngineConfig::from_lookup(lookup(&[("FLOWRUN_RUN_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Settings(_)));
        assert!(err.to_string().contains("FLOWRUN_RUN_MAX_RETRIES"));
    }

    #[test]
    fn test_run_options_builder() {
        let options = RunOptions::new()
            .with_priority(7)
            .with_max_retries(1)
            .with_task_max_retries(0)
            .with_retry_delay_ms(10)
            .with_timeout_ms(60_000)
            .with_metadata(serde_json::json!({"source": "test"}));

        assert_eq!(options.priority, 7);
        assert_eq!(options.max_retries, Some(1));
        assert_eq!(options.task_max_retries, Some(0));
        assert_eq!(options.retry_delay_ms, Some(10));
        assert_eq!(options.timeout_ms, Some(60_000));
        assert_eq!(options.metadata["source"], "test");
    }
}
