//! Per-node outcomes and the derived cluster-wide conditions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    InProgress,
    Available,
    Error,
}

/// One node's last known result for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub last_generation: i64,
    pub status: NodeState,
    #[serde(default)]
    pub error: String,
}

impl NodeStatus {
    pub fn new(generation: i64, status: NodeState, error: impl Into<String>) -> Self {
        Self {
            last_generation: generation,
            status,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    InProgress,
    Available,
    Error,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionKind::InProgress => "InProgress",
            ConditionKind::Available => "Available",
            ConditionKind::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub status: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigStatus {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl NodeConfigStatus {
    pub fn condition(&self, kind: ConditionKind) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// The condition currently set to true, if any.
    pub fn active_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.status)
    }

    /// Replaces this node's entry and recomputes all conditions.
    pub fn record(&mut self, node: &str, outcome: NodeStatus, matching_nodes: usize) {
        self.nodes.insert(node.to_string(), outcome);
        self.conditions = aggregate(&self.nodes, matching_nodes);
    }
}

/// Derives the three conditions from the recorded node outcomes.
///
/// `matching_nodes` is the number of nodes the selector matches right now.
/// Recorded entries of nodes that stopped matching still count. Exactly one
/// condition comes back true; the other two are present and false.
pub fn aggregate(nodes: &BTreeMap<String, NodeStatus>, matching_nodes: usize) -> Vec<Condition> {
    let count = |state: NodeState| nodes.values().filter(|n| n.status == state).count();
    let errors = count(NodeState::Error);
    let in_progress = count(NodeState::InProgress);
    let available = count(NodeState::Available);

    let (active, reason) = if errors > 0 {
        (
            ConditionKind::Error,
            format!("{}/{} nodes in error", errors, matching_nodes),
        )
    } else if available != matching_nodes {
        (
            ConditionKind::InProgress,
            format!("{}/{} nodes in progress", in_progress, matching_nodes),
        )
    } else {
        (ConditionKind::Available, "all nodes configured".to_string())
    };

    [
        ConditionKind::InProgress,
        ConditionKind::Available,
        ConditionKind::Error,
    ]
    .into_iter()
    .map(|kind| Condition {
        kind,
        status: kind == active,
        reason: reason.clone(),
    })
    .collect()
}
