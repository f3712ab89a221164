//! One reconciliation pass of one object on this node.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

use noco_config::AgentConfig;
use noco_host_modules::{modules_for, reconcile_module, HostContext, ModuleError};
use noco_nodeconfig::{finalizer_for, validate_spec, NodeConfig, NodeState, ObjectKey};

use crate::nodes::NodeSource;
use crate::status::StatusWriter;
use crate::store::ObjectStore;
use crate::AgentError;

/// Driver settings taken from the agent configuration.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub node_name: String,
    pub enforce_node_ready: bool,
    pub resync_interval: Duration,
    pub poll_interval: Duration,
    pub not_ready_backoff: Duration,
    pub pass_timeout: Option<Duration>,
    pub status_retry_attempts: u32,
    pub status_retry_backoff: Duration,
}

impl DriverSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            enforce_node_ready: config.enforce_node_ready,
            resync_interval: config.resync_interval(),
            poll_interval: config.poll_interval(),
            not_ready_backoff: config.not_ready_backoff(),
            pass_timeout: config.pass_timeout(),
            status_retry_attempts: config.status_retry_attempts,
            status_retry_backoff: config.status_retry_backoff(),
        }
    }
}

/// What a pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The object does not exist (any more).
    NotFound,
    /// The object is being deleted; only finalizer bookkeeping happened.
    Finalized,
    /// The selector does not target this node. No status is written.
    NotTargeted,
    NotReady,
    Available,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassResult {
    pub outcome: Outcome,
    /// When this object should be looked at again.
    pub requeue_after: Option<Duration>,
}

impl PassResult {
    fn done(outcome: Outcome) -> Self {
        Self {
            outcome,
            requeue_after: None,
        }
    }

    fn requeue(outcome: Outcome, after: Duration) -> Self {
        Self {
            outcome,
            requeue_after: Some(after),
        }
    }
}

pub struct Driver {
    settings: DriverSettings,
    host: HostContext,
    store: Arc<dyn ObjectStore>,
    nodes: Arc<dyn NodeSource>,
    status: StatusWriter,
    finalizer: String,
}

impl Driver {
    pub fn new(
        settings: DriverSettings,
        host: HostContext,
        store: Arc<dyn ObjectStore>,
        nodes: Arc<dyn NodeSource>,
    ) -> Self {
        let status = StatusWriter::new(
            store.clone(),
            nodes.clone(),
            &settings.node_name,
            settings.status_retry_attempts,
            settings.status_retry_backoff,
        );
        let finalizer = finalizer_for(&settings.node_name);
        Self {
            settings,
            host,
            store,
            nodes,
            status,
            finalizer,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.settings.node_name
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub(crate) fn nodes(&self) -> &Arc<dyn NodeSource> {
        &self.nodes
    }

    /// Runs one pass for `key`.
    ///
    /// Module failures end up in the object's status and in the returned
    /// outcome. `Err` is reserved for store and node source failures.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<PassResult, AgentError> {
        let node = self.node_name();
        let Some(object) = self.store.get(key).await? else {
            debug!(node, object = %key, "object not found, ignoring");
            return Ok(PassResult::done(Outcome::NotFound));
        };

        if object.is_deleting() {
            self.release(key).await?;
            return Ok(PassResult::done(Outcome::Finalized));
        }

        let this_node = self.nodes.get(node).await?;
        let targeted = match &this_node {
            Some(n) => n.is_targeted_by(&object.spec.node_selector, node),
            None => object.spec.node_selector.is_empty(),
        };
        if !targeted {
            debug!(node, object = %key, "selector does not match this node");
            return Ok(PassResult::done(Outcome::NotTargeted));
        }

        if self.settings.enforce_node_ready && !this_node.map_or(false, |n| n.ready) {
            let message = format!("node {} is not ready", node);
            info!(node, object = %key, "{}", message);
            self.status.set(key, NodeState::Error, &message).await?;
            return Ok(PassResult::requeue(Outcome::NotReady, self.settings.not_ready_backoff));
        }

        let seen = object
            .status
            .nodes
            .get(node)
            .map_or(false, |s| s.last_generation == object.metadata.generation);
        if !seen {
            self.status.set(key, NodeState::InProgress, "").await?;
        }

        let Some(object) = self.claim(key).await? else {
            return Ok(PassResult::done(Outcome::NotFound));
        };

        info!(node, object = %key, generation = object.metadata.generation, "reconciling node");
        let outcome = match self.run_modules(&object).await {
            Ok(()) => {
                self.status.set(key, NodeState::Available, "").await?;
                info!(node, object = %key, "node reconciled");
                Outcome::Available
            }
            Err(message) => {
                error!(node, object = %key, error = %message, "reconciliation failed");
                self.status.set(key, NodeState::Error, &message).await?;
                Outcome::Error(message)
            }
        };
        Ok(PassResult::requeue(outcome, self.settings.resync_interval))
    }

    /// Runs the declared modules in order, stopping at the first failure.
    async fn run_modules(&self, object: &NodeConfig) -> Result<(), String> {
        // Objects can reach the store without going through admission.
        validate_spec(&object.spec).map_err(|e| e.to_string())?;

        let pass = async {
            for module in modules_for(&object.spec, &object.key()) {
                let change = reconcile_module(module.as_ref(), &self.host).await?;
                debug!(object = %object.key(), module = %module.kind(), ?change, "module done");
            }
            Ok::<(), ModuleError>(())
        };

        match self.settings.pass_timeout {
            Some(limit) => match timeout(limit, pass).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("reconciliation pass timed out after {:?}", limit)),
            },
            None => pass.await.map_err(|e| e.to_string()),
        }
    }

    /// Adds this node's finalizer, returning the object as stored.
    async fn claim(&self, key: &ObjectKey) -> Result<Option<NodeConfig>, AgentError> {
        self.edit_finalizers(key, |object, finalizer| object.add_finalizer(finalizer))
            .await
    }

    /// Removes this node's finalizer from an object being deleted.
    async fn release(&self, key: &ObjectKey) -> Result<(), AgentError> {
        self.edit_finalizers(key, |object, finalizer| object.remove_finalizer(finalizer))
            .await?;
        info!(node = self.node_name(), object = %key, "finalizer released");
        Ok(())
    }

    /// Re-reads and updates on conflict, like the status writes.
    async fn edit_finalizers<F>(&self, key: &ObjectKey, edit: F) -> Result<Option<NodeConfig>, AgentError>
    where
        F: Fn(&mut NodeConfig, &str) -> bool + Send + Sync,
    {
        let attempts = self.settings.status_retry_attempts.max(1);
        for _ in 0..attempts {
            let Some(mut object) = self.store.get(key).await? else {
                return Ok(None);
            };
            if !edit(&mut object, &self.finalizer) {
                return Ok(Some(object));
            }
            match self.store.update(&object).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() => {
                    tokio::time::sleep(self.settings.status_retry_backoff).await
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AgentError::StatusConflict {
            key: key.clone(),
            attempts,
        })
    }
}
