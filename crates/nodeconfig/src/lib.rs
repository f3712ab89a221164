//! The NodeConfig object: declared host state for a set of nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod selector;
pub mod spec;
pub mod status;
pub mod validation;

pub use selector::{NodeSelector, SelectorError, SelectorOperator, SelectorRequirement};
pub use spec::*;
pub use status::{aggregate, Condition, ConditionKind, NodeConfigStatus, NodeState, NodeStatus};
pub use validation::{admit, check_conflicts, validate_spec, ValidationError};

/// Label every node carries with its own name.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

const FINALIZER_PREFIX: &str = "nodeconfig.noco.dev/finalizer-";

pub fn finalizer_for(node: &str) -> String {
    format!("{}{}", FINALIZER_PREFIX, node)
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid object key {0:?}, expected <namespace>/<name>")]
pub struct ParseKeyError(String);

/// `namespace/name` identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(ObjectKey::new(ns, name))
            }
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Bumped by the store on every spec change.
    #[serde(default)]
    pub generation: i64,
    /// Optimistic concurrency token, bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeConfigSpec,
    #[serde(default)]
    pub status: NodeConfigStatus,
}

impl NodeConfig {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: namespace.to_string(),
                name: name.to_string(),
                generation: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != finalizer);
        before != self.metadata.finalizers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_parse() {
        assert_eq!("ns/a".parse::<ObjectKey>(), Ok(ObjectKey::new("ns", "a")));
        assert!("a".parse::<ObjectKey>().is_err());
        assert!("/a".parse::<ObjectKey>().is_err());
        assert!("ns/a/b".parse::<ObjectKey>().is_err());
        assert_eq!(ObjectKey::new("ns", "a").to_string(), "ns/a");
    }

    #[test]
    fn test_finalizers() {
        let mut obj = NodeConfig::new("ns", "a");
        let f = finalizer_for("worker-1");

        assert!(obj.add_finalizer(&f));
        assert!(!obj.add_finalizer(&f));
        assert!(obj.has_finalizer("nodeconfig.noco.dev/finalizer-worker-1"));
        assert!(obj.remove_finalizer(&f));
        assert!(!obj.remove_finalizer(&f));
    }

    #[test]
    fn test_deserialize_full_object() {
        let obj: NodeConfig = serde_json::from_str(
            r#"{
                "metadata": {"namespace": "infra", "name": "sysctl", "generation": 3},
                "spec": {
                    "nodeSelector": [{"key": "env", "operator": "In", "values": ["prod"]}],
                    "kernelParameters": {"parameters": [{"name": "net.ipv4.ip_forward", "value": "1"}]}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(obj.key(), ObjectKey::new("infra", "sysctl"));
        assert_eq!(obj.metadata.generation, 3);
        assert!(!obj.is_deleting());
        assert_eq!(obj.spec.present_modules(), vec![ModuleKind::KernelParameters]);
        assert!(obj.status.nodes.is_empty());
    }
}
