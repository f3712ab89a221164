//! Writes this node's outcome into an object's status.
//!
//! Every matching node agent writes the same status document, so conflicts
//! are normal. Each attempt re-reads the object, replaces only this node's
//! entry, recomputes the conditions and writes back.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use noco_nodeconfig::{NodeState, NodeStatus, ObjectKey};

use crate::nodes::NodeSource;
use crate::store::ObjectStore;
use crate::AgentError;

pub struct StatusWriter {
    store: Arc<dyn ObjectStore>,
    nodes: Arc<dyn NodeSource>,
    node_name: String,
    attempts: u32,
    backoff: Duration,
}

impl StatusWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        nodes: Arc<dyn NodeSource>,
        node_name: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            nodes,
            node_name: node_name.to_string(),
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Records `state` for this node. A vanished object is not an error.
    pub async fn set(&self, key: &ObjectKey, state: NodeState, message: &str) -> Result<(), AgentError> {
        for attempt in 1..=self.attempts {
            let Some(mut object) = self.store.get(key).await? else {
                return Ok(());
            };
            let mut matching = self.nodes.count_matching(&object.spec.node_selector).await?;
            // A writer missing from the inventory is still a targeted node.
            if self.nodes.get(&self.node_name).await?.is_none() {
                matching += 1;
            }
            let outcome = NodeStatus::new(object.metadata.generation, state, message);
            object.status.record(&self.node_name, outcome, matching);

            match self.store.update_status(&object).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!(object = %key, attempt, "status write conflicted, retrying");
                    sleep(self.backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AgentError::StatusConflict {
            key: key.clone(),
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Node, StaticNodes};
    use crate::test_utils::MemoryStore;
    use noco_nodeconfig::{ConditionKind, NodeConfig};

    fn writer(store: Arc<MemoryStore>, node: &str, attempts: u32) -> StatusWriter {
        let nodes = Arc::new(StaticNodes::new(vec![Node::new("n1"), Node::new("n2"), Node::new("n3")]));
        StatusWriter::new(store, nodes, node, attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_each_node_writes_its_own_entry() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(NodeConfig::new("infra", "a"));

        writer(store.clone(), "n1", 5).set(&key, NodeState::Available, "").await.unwrap();
        writer(store.clone(), "n2", 5).set(&key, NodeState::Error, "hosts: boom").await.unwrap();

        let object = store.object(&key).unwrap();
        assert_eq!(object.status.nodes.len(), 2);
        assert_eq!(object.status.nodes["n2"].error, "hosts: boom");
        let active = object.status.active_condition().unwrap();
        assert_eq!(active.kind, ConditionKind::Error);
        assert_eq!(active.reason, "1/3 nodes in error");
    }

    #[tokio::test]
    async fn test_node_missing_from_inventory_is_counted() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(NodeConfig::new("infra", "a"));
        let nodes = Arc::new(StaticNodes::new(vec![]));
        let writer = StatusWriter::new(store.clone(), nodes, "n1", 5, Duration::from_millis(1));

        writer.set(&key, NodeState::Error, "node n1 is not ready").await.unwrap();
        let active = store.object(&key).unwrap().status.active_condition().cloned().unwrap();
        assert_eq!(active.reason, "1/1 nodes in error");
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(NodeConfig::new("infra", "a"));
        store.inject_conflicts(3);

        writer(store.clone(), "n1", 5).set(&key, NodeState::Available, "").await.unwrap();
        assert_eq!(store.object(&key).unwrap().status.nodes["n1"].status, NodeState::Available);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(NodeConfig::new("infra", "a"));
        store.inject_conflicts(10);

        let err = writer(store.clone(), "n1", 3)
            .set(&key, NodeState::Available, "")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StatusConflict { attempts: 3, .. }));
        assert!(store.object(&key).unwrap().status.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        writer(store, "n1", 5)
            .set(&ObjectKey::new("infra", "gone"), NodeState::Available, "")
            .await
            .unwrap();
    }
}
