//! The execution coordinator and the policies it applies.
//!
//! - [`ExecutionCoordinator`]: start, dispatch, report, cancel, retry, and
//!   completion evaluation for runs
//! - [`readiness`]: dependency readiness over a freshly loaded task list
//! - [`RetryPolicy`]: transient error classification and backoff
//! - [`EngineConfig`] / [`RunOptions`]: settings and per-run options

mod config;
mod coordinator;
pub mod readiness;
mod retry;
mod status;
mod tail;


pub use config::{DanglingDependencyPolicy, EngineConfig, RunOptions};
pub use coordinator::{CompletionOutcome, ExecutionCoordinator, FailureOutcome};
pub use readiness::{has_forward_progress, ready_tasks, TaskIndex};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use status::{ExecutionStatus, ProgressSummary};
