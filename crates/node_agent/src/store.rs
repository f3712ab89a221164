//! The shared object store: where NodeConfig objects live and where every
//! node agent writes its status.
//!
//! Writes follow the usual control-plane rules. `resource_version` is the
//! optimistic concurrency token, `generation` counts spec changes, and an
//! object with finalizers is only marked for deletion until the last
//! finalizer is gone.

use async_trait::async_trait;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use walkdir::WalkDir;

use noco_nodeconfig::{NodeConfig, ObjectKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("conflict writing {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("invalid object key {0}")]
    InvalidKey(ObjectKey),

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<NodeConfig>, StoreError>;

    /// All objects, ordered by key.
    async fn list(&self) -> Result<Vec<NodeConfig>, StoreError>;

    /// Creates the object or replaces the spec of an existing one.
    /// Status and finalizers of an existing object are kept.
    async fn apply(&self, object: NodeConfig) -> Result<NodeConfig, StoreError>;

    /// Writes metadata (finalizers) and spec. Fails with
    /// [`StoreError::Conflict`] if the object changed since it was read.
    async fn update(&self, object: &NodeConfig) -> Result<NodeConfig, StoreError>;

    /// Writes only the status, with the same conflict rule as `update`.
    async fn update_status(&self, object: &NodeConfig) -> Result<NodeConfig, StoreError>;

    /// Removes the object, or marks it for deletion while finalizers remain.
    async fn delete(&self, key: &ObjectKey) -> Result<Deletion, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Removed,
    /// Deletion timestamp set, waiting for finalizers.
    Pending,
}

// ============================================================================
// Write rules shared by every store implementation
// ============================================================================

/// The outcome of a checked write.
#[derive(Debug)]
pub(crate) enum Write {
    Put(NodeConfig),
    Remove,
}

fn check_version(stored: &NodeConfig, incoming: &NodeConfig) -> Result<(), StoreError> {
    if stored.metadata.resource_version != incoming.metadata.resource_version {
        return Err(StoreError::Conflict {
            key: stored.key(),
            expected: incoming.metadata.resource_version,
            actual: stored.metadata.resource_version,
        });
    }
    Ok(())
}

pub(crate) fn apply_object(stored: Option<NodeConfig>, incoming: NodeConfig) -> NodeConfig {
    match stored {
        None => {
            let mut created = NodeConfig::new(&incoming.metadata.namespace, &incoming.metadata.name);
            created.spec = incoming.spec;
            created.metadata.resource_version = 1;
            created
        }
        Some(mut next) => {
            if next.spec != incoming.spec {
                next.spec = incoming.spec;
                next.metadata.generation += 1;
            }
            next.metadata.resource_version += 1;
            next
        }
    }
}

pub(crate) fn update_object(stored: NodeConfig, incoming: &NodeConfig) -> Result<Write, StoreError> {
    check_version(&stored, incoming)?;
    let mut next = stored;
    next.metadata.finalizers = incoming.metadata.finalizers.clone();
    if next.spec != incoming.spec {
        next.spec = incoming.spec.clone();
        next.metadata.generation += 1;
    }
    next.metadata.resource_version += 1;

    if next.is_deleting() && next.metadata.finalizers.is_empty() {
        Ok(Write::Remove)
    } else {
        Ok(Write::Put(next))
    }
}

pub(crate) fn update_status_object(stored: NodeConfig, incoming: &NodeConfig) -> Result<NodeConfig, StoreError> {
    check_version(&stored, incoming)?;
    let mut next = stored;
    next.status = incoming.status.clone();
    next.metadata.resource_version += 1;
    Ok(next)
}

pub(crate) fn delete_object(stored: NodeConfig) -> Write {
    if stored.metadata.finalizers.is_empty() {
        return Write::Remove;
    }
    let mut next = stored;
    if next.metadata.deletion_timestamp.is_none() {
        next.metadata.deletion_timestamp = Some(now_timestamp());
        next.metadata.resource_version += 1;
    }
    Write::Put(next)
}

/// Seconds since the epoch.
fn now_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// DirStore - one JSON file per object
// ============================================================================

/// Objects as `<root>/<namespace>/<name>.json`.
///
/// Writes from this process are serialized; concurrent writers in other
/// processes are detected through the resource version only.
pub struct DirStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn path(&self, key: &ObjectKey) -> Result<PathBuf, StoreError> {
        let plain = |s: &str| !s.is_empty() && !s.starts_with('.') && !s.contains(['/', '\\']);
        if !plain(&key.namespace) || !plain(&key.name) {
            return Err(StoreError::InvalidKey(key.clone()));
        }
        Ok(self.root.join(&key.namespace).join(format!("{}.json", key.name)))
    }

    async fn read(&self, path: &Path) -> Result<Option<NodeConfig>, StoreError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn read_key(&self, key: &ObjectKey) -> Result<Option<NodeConfig>, StoreError> {
        self.read(&self.path(key)?).await
    }

    async fn write(&self, object: &NodeConfig) -> Result<(), StoreError> {
        let path = self.path(&object.key())?;
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut json = serde_json::to_string_pretty(object).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        json.push('\n');

        // Temp file plus rename, so readers never see a half-written object.
        spawn_blocking(move || -> io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(io::Error::from)??;
        Ok(())
    }

    async fn commit(&self, key: &ObjectKey, write: Write) -> Result<Option<NodeConfig>, StoreError> {
        match write {
            Write::Put(object) => {
                self.write(&object).await?;
                Ok(Some(object))
            }
            Write::Remove => {
                match fs::remove_file(self.path(key)?).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(None)
            }
        }
    }

    /// Object files, two levels below the root.
    async fn object_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let root = self.root.clone();
        let files = spawn_blocking(move || -> io::Result<Vec<PathBuf>> {
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
                let entry = entry.map_err(io::Error::from)?;
                let is_json = entry.path().extension().map_or(false, |ext| ext == "json");
                if entry.file_type().is_file() && is_json {
                    files.push(entry.into_path());
                }
            }
            Ok(files)
        })
        .await
        .map_err(io::Error::from)??;
        Ok(files)
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<NodeConfig>, StoreError> {
        self.read_key(key).await
    }

    async fn list(&self) -> Result<Vec<NodeConfig>, StoreError> {
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut objects = Vec::new();
        for path in self.object_files().await? {
            if let Some(object) = self.read(&path).await? {
                objects.push(object);
            }
        }
        objects.sort_by_key(|o| o.key());
        Ok(objects)
    }

    async fn apply(&self, object: NodeConfig) -> Result<NodeConfig, StoreError> {
        let _guard = self.lock.lock().await;
        let stored = self.read_key(&object.key()).await?;
        let next = apply_object(stored, object);
        self.write(&next).await?;
        Ok(next)
    }

    async fn update(&self, object: &NodeConfig) -> Result<NodeConfig, StoreError> {
        let _guard = self.lock.lock().await;
        let key = object.key();
        let stored = self.read_key(&key).await?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let write = update_object(stored, object)?;
        // A removed object is returned as last written.
        Ok(self.commit(&key, write).await?.unwrap_or_else(|| object.clone()))
    }

    async fn update_status(&self, object: &NodeConfig) -> Result<NodeConfig, StoreError> {
        let _guard = self.lock.lock().await;
        let key = object.key();
        let stored = self.read_key(&key).await?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let next = update_status_object(stored, object)?;
        self.write(&next).await?;
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<Deletion, StoreError> {
        let _guard = self.lock.lock().await;
        let stored = self.read_key(key).await?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        match self.commit(key, delete_object(stored)).await? {
            Some(_) => Ok(Deletion::Pending),
            None => Ok(Deletion::Removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noco_nodeconfig::{KernelModules, NodeState, NodeStatus};
    use tempfile::TempDir;

    fn object(name: &str) -> NodeConfig {
        let mut object = NodeConfig::new("infra", name);
        object.spec.kernel_modules = KernelModules {
            modules: vec!["overlay".into()],
            ..Default::default()
        };
        object
    }

    #[tokio::test]
    async fn test_apply_creates_then_bumps_generation_on_spec_change() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());

        let created = store.apply(object("a")).await.unwrap();
        assert_eq!(created.metadata.generation, 1);
        assert_eq!(created.metadata.resource_version, 1);
        assert!(temp.path().join("infra/a.json").exists());

        let same = store.apply(object("a")).await.unwrap();
        assert_eq!(same.metadata.generation, 1);

        let mut changed = object("a");
        changed.spec.kernel_modules.modules.push("br_netfilter".into());
        let changed = store.apply(changed).await.unwrap();
        assert_eq!(changed.metadata.generation, 2);
        assert_eq!(changed.metadata.resource_version, 3);
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());
        let created = store.apply(object("a")).await.unwrap();

        let mut first = created.clone();
        first.status.nodes.insert("n1".into(), NodeStatus::new(1, NodeState::Available, ""));
        store.update_status(&first).await.unwrap();

        let mut second = created;
        second.status.nodes.insert("n2".into(), NodeStatus::new(1, NodeState::Available, ""));
        let err = store.update_status(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_status_write_keeps_spec() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());
        let created = store.apply(object("a")).await.unwrap();

        let mut write = created.clone();
        write.spec = Default::default();
        write.status.nodes.insert("n1".into(), NodeStatus::new(1, NodeState::Error, "boom"));
        store.update_status(&write).await.unwrap();

        let stored = store.get(&created.key()).await.unwrap().unwrap();
        assert_eq!(stored.spec, created.spec);
        assert_eq!(stored.status.nodes["n1"].error, "boom");
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());
        let created = store.apply(object("a")).await.unwrap();

        let mut with_finalizer = created.clone();
        with_finalizer.add_finalizer("nodeconfig.noco.dev/finalizer-n1");
        store.update(&with_finalizer).await.unwrap();

        assert_eq!(store.delete(&created.key()).await.unwrap(), Deletion::Pending);
        let mut deleting = store.get(&created.key()).await.unwrap().unwrap();
        assert!(deleting.is_deleting());

        deleting.remove_finalizer("nodeconfig.noco.dev/finalizer-n1");
        store.update(&deleting).await.unwrap();
        assert!(store.get(&created.key()).await.unwrap().is_none());
        assert!(!temp.path().join("infra/a.json").exists());
    }

    #[tokio::test]
    async fn test_delete_without_finalizers_removes() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());
        store.apply(object("a")).await.unwrap();

        let key = ObjectKey::new("infra", "a");
        assert_eq!(store.delete(&key).await.unwrap(), Deletion::Removed);
        assert!(matches!(store.delete(&key).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_applies_leave_only_object_files() {
        let temp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(DirStore::new(temp.path().join("objects")));
        assert!(store.list().await.unwrap().is_empty());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.apply(object(&format!("o{}", i))).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.list().await.unwrap().len(), 8);
        let entries: Vec<_> = std::fs::read_dir(temp.path().join("objects/infra"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 8);
        assert!(entries.iter().all(|name| name.ends_with(".json")));
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_skips_other_files() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());
        store.apply(object("b")).await.unwrap();
        store.apply(object("a")).await.unwrap();
        std::fs::write(temp.path().join("infra/notes.txt"), "x").unwrap();

        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.metadata.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_root_lists_nothing() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());
        let err = store.get(&ObjectKey::new("..", "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
