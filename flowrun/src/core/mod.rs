//! Core domain model types for flowrun.
//!
//! This module contains the records the engine persists:
//! - Run, task, and log status enums
//! - The run record and its transitions
//! - Task records, executor results, and dispatch payloads
//! - Sequence-numbered log entries

mod log;
mod run;
mod status;
mod task;

pub use log::{LogEntry, NewLogEntry};
pub use run::{compute_progress, Run, RunTransition};
pub use status::{LogCategory, LogLevel, RunStatus, TaskStatus};
pub use task::{DispatchTask, Task, TaskMetrics, TaskResult, TaskTransition};
