//! Task retry classification and backoff.
//!
//! Retries are never slept on: a decision produces a delay, and the
//! coordinator persists `now + delay` as the task's `next_retry_at`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::Task;
use crate::errors::{codes, ErrorPayload};

/// How the delay grows with each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry_count
    #[default]
    Exponential,
    /// delay = base * (retry_count + 1)
    Linear,
    /// delay = base
    Constant,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Outcome of classifying a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// Delay before the task becomes claimable again.
        delay_ms: u64,
    },
    /// The code is retryable but the task's budget is spent.
    Exhausted,
    /// The code is never retried.
    NotRetryable,
}

fn default_retryable_codes() -> BTreeSet<String> {
    codes::DEFAULT_RETRYABLE.iter().map(|c| (*c).to_string()).collect()
}

fn default_base_delay_ms() -> u64 {
    1000
}

/// Which task errors are retried, and how long to wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Error codes treated as transient.
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: BTreeSet<String>,
    /// Base delay for tasks whose node does not override it.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth of the delay.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Upper bound on a single delay. Unbounded when `None`.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable_codes: default_retryable_codes(),
            base_delay_ms: default_base_delay_ms(),
            backoff: BackoffStrategy::default(),
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay_ms: u64) -> Self {
        self.base_delay_ms = delay_ms;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Caps every delay at `max_delay_ms`.
    #[must_use]
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    /// Adds a code to the retryable set.
    #[must_use]
    pub fn with_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_codes.insert(code.into());
        self
    }

    /// Replaces the retryable set.
    #[must_use]
    pub fn with_retryable_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if `code` is transient.
    #[must_use]
    pub fn is_retryable(&self, code: &str) -> bool {
        self.retryable_codes.contains(code)
    }

    /// Delay before retry number `retry_count + 1`, given a base delay.
    #[must_use]
    pub fn delay_for(&self, base_delay_ms: u64, retry_count: u32) -> u64 {
        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                base_delay_ms.saturating_mul(2u64.checked_pow(retry_count).unwrap_or(u64::MAX))
            }
            BackoffStrategy::Linear => {
                base_delay_ms.saturating_mul(u64::from(retry_count).saturating_add(1))
            }
            BackoffStrategy::Constant => base_delay_ms,
        };
        self.max_delay_ms.map_or(delay, |cap| delay.min(cap))
    }

    /// Classifies a failure of a RUNNING task.
    #[must_use]
    pub fn decide(&self, task: &Task, error: &ErrorPayload) -> RetryDecision {
        if !self.is_retryable(&error.code) {
            return RetryDecision::NotRetryable;
        }
        if task.retry_count >= task.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            delay_ms: self.delay_for(task.retry_delay_ms, task.retry_count),
        }
    }
}
