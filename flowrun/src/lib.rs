//! # Flowrun
//!
//! A persistence-backed engine for executing pipelines of dependent tasks.
//!
//! A pipeline is a set of nodes joined by connections. Starting a run turns
//! every node into a PENDING task row; an external executor then polls the
//! engine, receives the tasks whose dependencies have all completed, does the
//! work, and reports each result back. All state lives in the stores:
//!
//! - **Runs**: one row per execution with status, counts, and outputs
//! - **Tasks**: one row per node with status, retries, and results
//! - **Logs**: an append-only stream per run with gap-free sequence numbers
//!
//! Every state change is a conditional transition, so several coordinators
//! can poll the same run without claiming a task twice.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowrun::prelude::*;
//!
//! let provider = Arc::new(StaticConfigurationProvider::new());
//! provider.register(
//!     "etl",
//!     PipelineConfiguration::new()
//!         .node(NodeDefinition::new("fetch", "http"))
//!         .node(NodeDefinition::new("store", "db"))
//!         .connect("fetch", "store"),
//! );
//!
//! let coordinator = ExecutionCoordinator::new(Stores::in_memory(), provider);
//! let run = coordinator
//!     .start_execution("etl", "user-1", json!({}), RunOptions::default())
//!     .await?;
//!
//! for task in coordinator.execute_next_tasks(run.id).await? {
//!     coordinator.complete_task(task.id, TaskResult::success(json!({}))).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod core;
pub mod definition;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        DispatchTask, LogCategory, LogEntry, LogLevel, NewLogEntry, Run, RunStatus, Task,
        TaskMetrics, TaskResult, TaskStatus,
    };
    pub use crate::definition::{
        ConfigurationProvider, Connection, NodeDefinition, PipelineConfiguration,
        StaticConfigurationProvider,
    };
    pub use crate::engine::{
        EngineConfig, ExecutionCoordinator, ExecutionStatus, FailureOutcome, RetryPolicy,
        RunOptions,
    };
    pub use crate::errors::{codes, EngineError, ErrorPayload};
    pub use crate::events::{EngineEvent, EventKind, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::store::Stores;
    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteStores;
    pub use crate::utils::{now_utc, Timestamp};
}
