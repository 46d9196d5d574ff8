//! Tracing setup and span helpers.
//!
//! The engine only emits through `tracing`; installing a subscriber is left
//! to the host. [`init_tracing`] is a convenience for binaries and tests.

use std::str::FromStr;
use std::sync::Once;
use std::time::Instant;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Multi-line human-readable output.
    #[default]
    Pretty,
    /// Single-line human-readable output.
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Only the first call has an effect. If another subscriber is already
/// installed the call is a no-op.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
            LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        };
    });
}

/// Span wrapping work on one run.
#[must_use]
pub fn run_span(operation: &str, run_id: Uuid) -> Span {
    tracing::info_span!("flowrun.run", op = operation, run_id = %run_id)
}

/// Span wrapping work on one task.
#[must_use]
pub fn task_span(operation: &str, run_id: Uuid, task_id: Uuid, node_id: &str) -> Span {
    tracing::info_span!(
        "flowrun.task",
        op = operation,
        run_id = %run_id,
        task_id = %task_id,
        node_id = node_id,
    )
}

/// Measures wall time of a unit of work.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts the timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds since start, saturating.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_tracing_is_repeatable() {
        init_tracing(LogFormat::Compact);
        init_tracing(LogFormat::Json);
        let span = run_span("test", Uuid::nil());
        let _guard = span.enter();
        tracing::info!("inside run span");
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5);
    }
}
