//! Ready-made pipeline shapes and an engine wired for tests.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::executor::ScriptedExecutor;
use crate::core::{LogEntry, Run, RunStatus};
use crate::definition::{NodeDefinition, PipelineConfiguration, StaticConfigurationProvider};
use crate::engine::{EngineConfig, ExecutionCoordinator, RunOptions};
use crate::events::CollectingEventSink;
use crate::store::Stores;

/// Pipeline id under which [`TestEngine`] registers its configuration.
pub const TEST_PIPELINE: &str = "test-pipeline";

/// `n0 -> n1 -> ... -> n{len-1}`.
#[must_use]
pub fn linear(len: usize) -> PipelineConfiguration {
    let mut config = PipelineConfiguration::new();
    for i in 0..len {
        config = config.node(NodeDefinition::new(format!("n{i}"), "step"));
        if i > 0 {
            config = config.connect(format!("n{}", i - 1), format!("n{i}"));
        }
    }
    config
}

/// `a -> {b, c} -> d`.
#[must_use]
pub fn diamond() -> PipelineConfiguration {
    PipelineConfiguration::new()
        .node(NodeDefinition::new("a", "source"))
        .node(NodeDefinition::new("b", "map"))
        .node(NodeDefinition::new("c", "map"))
        .node(NodeDefinition::new("d", "join"))
        .connect("a", "b")
        .connect("a", "c")
        .connect("b", "d")
        .connect("c", "d")
}

/// `A`, `B` after `A`, and `C` after both.
#[must_use]
pub fn triangle() -> PipelineConfiguration {
    PipelineConfiguration::new()
        .node(NodeDefinition::new("A", "source").with_config(json!({"seed": 1})))
        .node(NodeDefinition::new("B", "map"))
        .node(NodeDefinition::new("C", "join"))
        .connect("A", "B")
        .connect("A", "C")
        .connect("B", "C")
}

/// One `root` feeding `width` independent leaves.
#[must_use]
pub fn fan_out(width: usize) -> PipelineConfiguration {
    let mut config = PipelineConfiguration::new().node(NodeDefinition::new("root", "source"));
    for i in 0..width {
        config = config
            .node(NodeDefinition::new(format!("leaf{i}"), "map"))
            .connect("root", format!("leaf{i}"));
    }
    config
}

/// In-memory coordinator with one registered pipeline and a collecting sink.
#[derive(Debug, Clone)]
pub struct TestEngine {
    /// The coordinator under test.
    pub coordinator: Arc<ExecutionCoordinator>,
    /// Provider holding [`TEST_PIPELINE`].
    pub provider: Arc<StaticConfigurationProvider>,
    /// Every event the coordinator emitted.
    pub events: Arc<CollectingEventSink>,
}

impl TestEngine {
    /// Creates an engine with default settings.
    #[must_use]
    pub fn new(configuration: PipelineConfiguration) -> Self {
        Self::with_config(configuration, EngineConfig::default())
    }

    /// Creates an engine with custom settings.
    #[must_use]
    pub fn with_config(configuration: PipelineConfiguration, config: EngineConfig) -> Self {
        Self::on_stores(Stores::in_memory(), configuration, config)
    }

    /// Creates an engine on the given stores.
    #[must_use]
    pub fn on_stores(
        stores: Stores,
        configuration: PipelineConfiguration,
        config: EngineConfig,
    ) -> Self {
        let provider = Arc::new(StaticConfigurationProvider::new());
        provider.register(TEST_PIPELINE, configuration);
        let events = Arc::new(CollectingEventSink::new());
        let coordinator = ExecutionCoordinator::new(stores, provider.clone())
            .with_config(config)
            .with_event_sink(events.clone());
        Self {
            coordinator: Arc::new(coordinator),
            provider,
            events,
        }
    }

    /// Starts a run with empty inputs.
    ///
    /// # Panics
    ///
    /// Panics if the run cannot be started.
    pub async fn start(&self) -> Run {
        self.start_with(RunOptions::default()).await
    }

    /// Starts a run with `options`.
    ///
    /// # Panics
    ///
    /// Panics if the run cannot be started.
    pub async fn start_with(&self, options: RunOptions) -> Run {
        self.coordinator
            .start_execution(TEST_PIPELINE, "test-user", json!({}), options)
            .await
            .expect("start_execution failed")
    }

    /// Runs every task to success and returns the final run status.
    ///
    /// # Panics
    ///
    /// Panics on engine errors or if the run does not settle.
    pub async fn drive_to_completion(&self, run_id: Uuid) -> RunStatus {
        ScriptedExecutor::new()
            .drive(&self.coordinator, run_id, 1_000)
            .await
            .expect("run did not settle")
    }

    /// Returns the run's full log.
    ///
    /// # Panics
    ///
    /// Panics if the log cannot be read.
    pub async fn logs(&self, run_id: Uuid) -> Vec<LogEntry> {
        self.coordinator
            .get_log_stream(run_id, 0)
            .await
            .expect("log stream failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_shapes() {
        let chain = linear(3);
        assert_eq!(chain.nodes.len(), 3);
        assert_eq!(chain.dependencies_of("n2").len(), 1);

        assert_eq!(diamond().dependencies_of("d").len(), 2);
        assert_eq!(triangle().dependencies_of("C").len(), 2);

        let fan = fan_out(4);
        assert_eq!(fan.nodes.len(), 5);
        assert!(fan.dangling_connections().is_empty());
    }

    #[tokio::test]
    async fn test_engine_drives_linear_run() {
        let engine = TestEngine::new(linear(3));
        let run = engine.start().await;
        assert_eq!(engine.drive_to_completion(run.id).await, RunStatus::Completed);
        assert!(!engine.events.is_empty());
    }
}
