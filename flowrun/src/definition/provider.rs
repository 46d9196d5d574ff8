//! Configuration lookup for pipelines.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::PipelineConfiguration;
use crate::errors::EngineError;

/// Resolves a pipeline id to its current configuration.
///
/// Returning `Ok(None)` means the pipeline is unknown; the coordinator turns
/// that into [`EngineError::ConfigurationNotFound`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigurationProvider: Send + Sync {
    /// Loads the configuration for a pipeline.
    async fn load(&self, pipeline_id: &str) -> Result<Option<PipelineConfiguration>, EngineError>;
}

/// A provider backed by a map of registered configurations.
#[derive(Debug, Default)]
pub struct StaticConfigurationProvider {
    configurations: RwLock<HashMap<String, PipelineConfiguration>>,
}

impl StaticConfigurationProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a configuration.
    pub fn register(&self, pipeline_id: impl Into<String>, configuration: PipelineConfiguration) {
        self.configurations
            .write()
            .insert(pipeline_id.into(), configuration);
    }

    /// Removes a configuration.
    pub fn remove(&self, pipeline_id: &str) -> Option<PipelineConfiguration> {
        self.configurations.write().remove(pipeline_id)
    }

    /// Returns the number of registered configurations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.configurations.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configurations.read().is_empty()
    }
}

#[async_trait]
impl ConfigurationProvider for StaticConfigurationProvider {
    async fn load(&self, pipeline_id: &str) -> Result<Option<PipelineConfiguration>, EngineError> {
        Ok(self.configurations.read().get(pipeline_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeDefinition;

    #[tokio::test]
    async fn test_static_provider_roundtrip() {
        let provider = StaticConfigurationProvider::new();
        assert!(provider.is_empty());

        let config = PipelineConfiguration::new().node(NodeDefinition::new("a", "noop"));
        provider.register("p1", config.clone());

        assert_eq!(provider.load("p1").await.unwrap(), Some(config));
        assert_eq!(provider.load("p2").await.unwrap(), None);

        provider.remove("p1");
        assert_eq!(provider.len(), 0);
    }
}
