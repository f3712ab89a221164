//! The per-node agent: drives every NodeConfig object that targets this
//! node to its declared state and reports the outcome in its status.

use thiserror::Error;

use noco_nodeconfig::ObjectKey;

pub mod agent;
pub mod driver;
pub mod nodes;
pub mod status;
pub mod store;

pub use agent::{Agent, Trigger};
pub use driver::{Driver, DriverSettings, Outcome, PassResult};
pub use nodes::{Node, NodeError, NodeSource, StaticNodes};
pub use status::StatusWriter;
pub use store::{Deletion, DirStore, ObjectStore, StoreError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Nodes(#[from] NodeError),

    #[error("write to {key} still conflicting after {attempts} attempts")]
    StatusConflict { key: ObjectKey, attempts: u32 },
}

// ============================================================================
// Test Utilities
// ============================================================================

pub mod test_utils {
    use super::*;
    use crate::store::{apply_object, delete_object, update_object, update_status_object, Write};
    use async_trait::async_trait;
    use noco_host_modules::{CommandOutput, CommandRunner};
    use noco_nodeconfig::NodeConfig;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory store with the same write rules as [`DirStore`] and a
    /// switch to make the next status writes conflict.
    #[derive(Default)]
    pub struct MemoryStore {
        objects: Mutex<BTreeMap<ObjectKey, NodeConfig>>,
        conflicts: Mutex<u32>,
        status_writes: Mutex<usize>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Stores `object` as freshly created.
        pub fn insert(&self, object: NodeConfig) -> ObjectKey {
            let key = object.key();
            let created = apply_object(None, object);
            self.objects.lock().unwrap().insert(key.clone(), created);
            key
        }

        /// Replaces the spec the way `apply` does.
        pub fn apply_spec(&self, object: NodeConfig) {
            let mut objects = self.objects.lock().unwrap();
            let key = object.key();
            let next = apply_object(objects.remove(&key), object);
            objects.insert(key, next);
        }

        pub fn object(&self, key: &ObjectKey) -> Option<NodeConfig> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        /// Deletes the object, keeping it around while finalizers remain.
        pub fn mark_deleting(&self, key: &ObjectKey) {
            let mut objects = self.objects.lock().unwrap();
            if let Some(stored) = objects.remove(key) {
                if let Write::Put(next) = delete_object(stored) {
                    objects.insert(key.clone(), next);
                }
            }
        }

        /// The next `n` status writes fail with a conflict.
        pub fn inject_conflicts(&self, n: u32) {
            *self.conflicts.lock().unwrap() = n;
        }

        /// Successful status writes so far.
        pub fn status_writes(&self) -> usize {
            *self.status_writes.lock().unwrap()
        }

        fn take_conflict(&self, key: &ObjectKey, object: &NodeConfig) -> Result<(), StoreError> {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts == 0 {
                return Ok(());
            }
            *conflicts -= 1;
            Err(StoreError::Conflict {
                key: key.clone(),
                expected: object.metadata.resource_version,
                actual: object.metadata.resource_version + 1,
            })
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn get(&self, key: &ObjectKey) -> Result<Option<NodeConfig>, StoreError> {
            Ok(self.object(key))
        }

        async fn list(&self) -> Result<Vec<NodeConfig>, StoreError> {
            Ok(self.objects.lock().unwrap().values().cloned().collect())
        }

        async fn apply(&self, object: NodeConfig) -> Result<NodeConfig, StoreError> {
            let key = object.key();
            self.apply_spec(object);
            self.object(&key).ok_or(StoreError::NotFound(key))
        }

        async fn update(&self, object: &NodeConfig) -> Result<NodeConfig, StoreError> {
            let key = object.key();
            let mut objects = self.objects.lock().unwrap();
            let stored = objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
            match update_object(stored, object)? {
                Write::Put(next) => {
                    objects.insert(key, next.clone());
                    Ok(next)
                }
                Write::Remove => {
                    objects.remove(&key);
                    Ok(object.clone())
                }
            }
        }

        async fn update_status(&self, object: &NodeConfig) -> Result<NodeConfig, StoreError> {
            let key = object.key();
            self.take_conflict(&key, object)?;
            let mut objects = self.objects.lock().unwrap();
            let stored = objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let next = update_status_object(stored, object)?;
            objects.insert(key, next.clone());
            *self.status_writes.lock().unwrap() += 1;
            Ok(next)
        }

        async fn delete(&self, key: &ObjectKey) -> Result<Deletion, StoreError> {
            if self.object(key).is_none() {
                return Err(StoreError::NotFound(key.clone()));
            }
            self.mark_deleting(key);
            Ok(match self.object(key) {
                Some(_) => Deletion::Pending,
                None => Deletion::Removed,
            })
        }
    }

    /// Driver settings with short retry backoffs and no pass deadline.
    pub fn settings(node: &str) -> DriverSettings {
        DriverSettings {
            node_name: node.to_string(),
            enforce_node_ready: true,
            resync_interval: Duration::from_secs(300),
            poll_interval: Duration::from_millis(20),
            not_ready_backoff: Duration::from_secs(300),
            pass_timeout: None,
            status_retry_attempts: 5,
            status_retry_backoff: Duration::from_millis(1),
        }
    }

    /// Succeeds every command after a delay.
    pub struct SlowRunner {
        delay: Duration,
    }

    impl SlowRunner {
        pub fn new(delay: Duration) -> Self {
            Self { delay }
        }
    }

    #[async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(&self, _program: &str, _args: &[&str]) -> std::io::Result<CommandOutput> {
            tokio::time::sleep(self.delay).await;
            Ok(CommandOutput::ok(""))
        }
    }
}
