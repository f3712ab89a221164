//! Node membership: labels for selector evaluation and the ready condition.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

use noco_config::StaticNode;
use noco_nodeconfig::{NodeSelector, HOSTNAME_LABEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,
}

impl Node {
    /// A ready node carrying only its hostname label.
    pub fn new(name: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(HOSTNAME_LABEL.to_string(), name.to_string());
        Self {
            name: name.to_string(),
            labels,
            ready: true,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Whether `selector` targets this node as `node_name`. An empty
    /// selector targets every node; otherwise the labels must match and
    /// the hostname label must be the node's own name.
    pub fn is_targeted_by(&self, selector: &NodeSelector, node_name: &str) -> bool {
        if selector.is_empty() {
            return true;
        }
        selector.matches(&self.labels)
            && self.labels.get(HOSTNAME_LABEL).map(String::as_str) == Some(node_name)
    }
}

#[derive(Debug, Error)]
#[error("node source unavailable: {0}")]
pub struct NodeError(pub String);

#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn list(&self) -> Result<Vec<Node>, NodeError>;

    async fn get(&self, name: &str) -> Result<Option<Node>, NodeError> {
        Ok(self.list().await?.into_iter().find(|n| n.name == name))
    }

    /// Number of nodes `selector` matches right now.
    async fn count_matching(&self, selector: &NodeSelector) -> Result<usize, NodeError> {
        Ok(self
            .list()
            .await?
            .iter()
            .filter(|n| selector.matches(&n.labels))
            .count())
    }
}

/// A fixed node inventory, from the agent configuration or set by tests.
#[derive(Default)]
pub struct StaticNodes {
    nodes: RwLock<Vec<Node>>,
}

impl StaticNodes {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Every configured node gets its hostname label if it lacks one.
    pub fn from_config(nodes: &[StaticNode]) -> Self {
        Self::new(
            nodes
                .iter()
                .map(|n| {
                    let mut node = Node::new(&n.name);
                    node.labels.extend(n.labels.clone());
                    node.ready = n.ready;
                    node
                })
                .collect(),
        )
    }

    /// Replaces or adds a node.
    pub fn upsert(&self, node: Node) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        match nodes.iter_mut().find(|n| n.name == node.name) {
            Some(existing) => *existing = node,
            None => nodes.push(node),
        }
    }
}

#[async_trait]
impl NodeSource for StaticNodes {
    async fn list(&self) -> Result<Vec<Node>, NodeError> {
        Ok(self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
