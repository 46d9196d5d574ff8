//! Pipeline definitions as handed over by the definition collaborator.
//!
//! A configuration is an ordered list of nodes plus the connections between
//! them. The engine only reads it: a task's dependency set is the set of
//! connection sources whose target is that task's node.

mod provider;

pub use provider::{ConfigurationProvider, StaticConfigurationProvider};

#[cfg(test)]
pub use provider::MockConfigurationProvider;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A single node in a pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node id, unique within the configuration.
    pub id: String,
    /// Node type understood by the executor.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Opaque node configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Per-node override of the task retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Per-node override of the base retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

impl NodeDefinition {
    /// Creates a node with an empty config.
    #[must_use]
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: serde_json::Value::Null,
            max_retries: None,
            retry_delay_ms: None,
        }
    }

    /// Sets the node config.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Overrides the base retry delay.
    #[must_use]
    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }
}

/// A directed edge: `target` consumes the output of `source`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    /// Upstream node id.
    pub source: String,
    /// Downstream node id.
    pub target: String,
}

impl Connection {
    /// Creates a connection.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A pipeline configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfiguration {
    /// Nodes in authoring order.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Connections between nodes.
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl PipelineConfiguration {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    #[must_use]
    pub fn node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds a connection.
    #[must_use]
    pub fn connect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.connections.push(Connection::new(source, target));
        self
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn find_node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Returns the source ids of all connections targeting `node_id`.
    #[must_use]
    pub fn dependencies_of(&self, node_id: &str) -> BTreeSet<String> {
        self.connections
            .iter()
            .filter(|c| c.target == node_id)
            .map(|c| c.source.clone())
            .collect()
    }

    /// Returns connections whose source or target is not a node.
    #[must_use]
    pub fn dangling_connections(&self) -> Vec<&Connection> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        self.connections
            .iter()
            .filter(|c| !ids.contains(c.source.as_str()) || !ids.contains(c.target.as_str()))
            .collect()
    }

    /// Returns each node's position in a dependency-respecting order.
    ///
    /// Ties are broken by authoring order. Cycles are not rejected here; a
    /// node on a cycle is placed when the traversal first returns to it.
    #[must_use]
    pub fn execution_order(&self) -> HashMap<String, u32> {
        let deps: HashMap<&str, BTreeSet<String>> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), self.dependencies_of(&n.id)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();

        fn visit<'a>(
            node: &'a str,
            deps: &'a HashMap<&'a str, BTreeSet<String>>,
            visited: &mut HashSet<&'a str>,
            in_progress: &mut HashSet<&'a str>,
            order: &mut Vec<&'a str>,
        ) {
            if visited.contains(node) || in_progress.contains(node) {
                return;
            }
            let Some(node_deps) = deps.get(node) else {
                return;
            };

            in_progress.insert(node);
            for dep in node_deps {
                if let Some((key, _)) = deps.get_key_value(dep.as_str()) {
                    visit(*key, deps, visited, in_progress, order);
                }
            }
            in_progress.remove(node);

            visited.insert(node);
            order.push(node);
        }

        for node in &self.nodes {
            visit(&node.id, &deps, &mut visited, &mut in_progress, &mut order);
        }

        order
            .into_iter()
            .enumerate()
            .map(|(idx, id)| (id.to_string(), u32::try_from(idx).unwrap_or(u32::MAX)))
            .collect()
    }
}
