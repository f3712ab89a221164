//! The agent loop: decides when each object gets a pass.
//!
//! The store and the node source are polled. A pass runs when an object
//! appears, its generation changes or it starts deleting, when this node's
//! labels or readiness change (every object), when a requeue comes due,
//! and on explicit [`Trigger`]s.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use noco_nodeconfig::ObjectKey;

use crate::driver::{Driver, Outcome};
use crate::nodes::Node;
use crate::AgentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Object(ObjectKey),
    All,
}

/// What a poll compares between scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    generation: i64,
    deleting: bool,
}

pub struct Agent {
    driver: Arc<Driver>,
    tx: mpsc::UnboundedSender<Trigger>,
    rx: mpsc::UnboundedReceiver<Trigger>,
    seen: BTreeMap<ObjectKey, Fingerprint>,
    /// `None` until the first scan; then this node as last seen.
    this_node: Option<Option<Node>>,
    requeues: BTreeMap<ObjectKey, Instant>,
}

impl Agent {
    pub fn new(driver: Arc<Driver>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            driver,
            tx,
            rx,
            seen: BTreeMap::new(),
            this_node: None,
            requeues: BTreeMap::new(),
        }
    }

    /// Handle for requesting passes from outside the loop.
    pub fn sender(&self) -> mpsc::UnboundedSender<Trigger> {
        self.tx.clone()
    }

    /// Runs until `shutdown` resolves. A pass in flight is finished first.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = interval(self.driver.settings().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node = self.driver.node_name(), "agent started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(node = self.driver.node_name(), "agent stopping");
                    return;
                }
                Some(trigger) = self.rx.recv() => self.handle(trigger).await,
                _ = ticker.tick() => self.poll().await,
            }
        }
    }

    async fn handle(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Object(key) => self.reconcile(&key).await,
            Trigger::All => self.reconcile_all().await,
        }
    }

    /// One pass over every stored object.
    pub async fn reconcile_all(&mut self) {
        let keys = match self.driver.store().list().await {
            Ok(objects) => objects.iter().map(|o| o.key()).collect::<Vec<_>>(),
            Err(e) => {
                error!(node = self.driver.node_name(), error = %e, "listing objects failed");
                return;
            }
        };
        for key in keys {
            self.reconcile(&key).await;
        }
    }

    async fn poll(&mut self) {
        match self.scan().await {
            Ok(changed) => {
                for key in changed {
                    self.reconcile(&key).await;
                }
            }
            Err(e) => error!(node = self.driver.node_name(), error = %e, "scanning for changes failed"),
        }

        let now = Instant::now();
        let due: Vec<ObjectKey> = self
            .requeues
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.reconcile(&key).await;
        }
    }

    /// Keys that need a pass since the last scan.
    async fn scan(&mut self) -> Result<Vec<ObjectKey>, AgentError> {
        let objects = self.driver.store().list().await?;
        let this_node = self.driver.nodes().get(self.driver.node_name()).await?;
        let node_changed = match self.this_node.replace(this_node.clone()) {
            Some(previous) => previous != this_node,
            None => false,
        };
        if node_changed {
            info!(node = self.driver.node_name(), "node labels or readiness changed");
        }

        let mut changed = Vec::new();
        let mut seen = BTreeMap::new();
        for object in &objects {
            let key = object.key();
            let fingerprint = Fingerprint {
                generation: object.metadata.generation,
                deleting: object.is_deleting(),
            };
            if node_changed || self.seen.get(&key) != Some(&fingerprint) {
                changed.push(key.clone());
            }
            seen.insert(key, fingerprint);
        }

        self.requeues.retain(|key, _| seen.contains_key(key));
        self.seen = seen;
        Ok(changed)
    }

    async fn reconcile(&mut self, key: &ObjectKey) {
        let node = self.driver.node_name().to_string();
        match self.driver.reconcile(key).await {
            Ok(result) => {
                debug!(node, object = %key, outcome = ?result.outcome, "pass finished");
                if matches!(result.outcome, Outcome::NotFound) {
                    self.seen.remove(key);
                }
                match result.requeue_after {
                    Some(after) => {
                        self.requeues.insert(key.clone(), Instant::now() + after);
                    }
                    None => {
                        self.requeues.remove(key);
                    }
                }
            }
            Err(e) => {
                error!(node, object = %key, error = %e, "reconciliation failed, retrying");
                let retry = Instant::now() + self.driver.settings().poll_interval;
                self.requeues.insert(key.clone(), retry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::StaticNodes;
    use crate::test_utils::{settings, MemoryStore};
    use noco_host_modules::test_utils::mock_host;
    use noco_nodeconfig::{NodeConfig, NodeSelector, NodeState, SelectorOperator, SelectorRequirement};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn object(name: &str) -> NodeConfig {
        let mut object = NodeConfig::new("infra", name);
        object.spec.kernel_modules.modules = vec!["overlay".into()];
        object
    }

    async fn wait_for<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn state(store: &MemoryStore, key: &ObjectKey, node: &str) -> Option<(i64, NodeState)> {
        store
            .object(key)
            .and_then(|o| o.status.nodes.get(node).map(|s| (s.last_generation, s.status)))
    }

    struct Running {
        _temp: TempDir,
        store: Arc<MemoryStore>,
        nodes: Arc<StaticNodes>,
        sender: mpsc::UnboundedSender<Trigger>,
        stop: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(store: Arc<MemoryStore>, nodes: Arc<StaticNodes>) -> Running {
        let temp = TempDir::new().unwrap();
        let (host, _) = mock_host(temp.path());
        let driver = Arc::new(Driver::new(settings("n1"), host, store.clone(), nodes.clone()));
        let agent = Agent::new(driver);
        let sender = agent.sender();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(agent.run(async {
            let _ = stopped.await;
        }));
        Running {
            _temp: temp,
            store,
            nodes,
            sender,
            stop,
            handle,
        }
    }

    #[tokio::test]
    async fn test_reconciles_existing_and_changed_objects() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(object("a"));
        let nodes = Arc::new(StaticNodes::new(vec![Node::new("n1")]));
        let running = start(store, nodes);

        wait_for(|| state(&running.store, &key, "n1") == Some((1, NodeState::Available))).await;

        let mut changed = running.store.object(&key).unwrap();
        changed.spec.kernel_modules.modules.push("br_netfilter".into());
        running.store.apply_spec(changed);
        wait_for(|| state(&running.store, &key, "n1") == Some((2, NodeState::Available))).await;

        let other = running.store.insert(object("b"));
        wait_for(|| state(&running.store, &other, "n1").is_some()).await;

        running.stop.send(()).unwrap();
        running.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_label_change_reconciles_untargeted_objects() {
        let store = Arc::new(MemoryStore::new());
        let mut selected = object("a");
        selected.spec.node_selector =
            NodeSelector::new(vec![SelectorRequirement::new("role", SelectorOperator::Exists, &[])]);
        let key = store.insert(selected);
        let nodes = Arc::new(StaticNodes::new(vec![Node::new("n1")]));
        let running = start(store, nodes);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state(&running.store, &key, "n1"), None);

        running.nodes.upsert(Node::new("n1").with_label("role", "worker"));
        wait_for(|| state(&running.store, &key, "n1") == Some((1, NodeState::Available))).await;

        running.stop.send(()).unwrap();
        running.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_deletion_is_picked_up() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(object("a"));
        let nodes = Arc::new(StaticNodes::new(vec![Node::new("n1")]));
        let running = start(store, nodes);

        wait_for(|| state(&running.store, &key, "n1").is_some()).await;
        wait_for(|| {
            running
                .store
                .object(&key)
                .map_or(false, |o| !o.metadata.finalizers.is_empty())
        })
        .await;

        running.store.mark_deleting(&key);
        wait_for(|| running.store.object(&key).is_none()).await;

        running.stop.send(()).unwrap();
        running.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_trigger() {
        let store = Arc::new(MemoryStore::new());
        let nodes = Arc::new(StaticNodes::new(vec![Node::new("n1").not_ready()]));
        let key = store.insert(object("a"));
        let running = start(store, nodes);

        wait_for(|| state(&running.store, &key, "n1").map(|s| s.1) == Some(NodeState::Error)).await;

        // Readiness changes are seen by the next scan; the trigger only
        // makes sure the pass happens.
        running.nodes.upsert(Node::new("n1"));
        running.sender.send(Trigger::Object(key.clone())).unwrap();
        wait_for(|| state(&running.store, &key, "n1").map(|s| s.1) == Some(NodeState::Available)).await;

        running.stop.send(()).unwrap();
        running.handle.await.unwrap();
    }
}
