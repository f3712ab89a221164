use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("node_name must be set (config file or NOCO_NODE_NAME)")]
    MissingNodeName,
}

/// Agent configuration, one per node.
///
/// Loaded from TOML, then overridden by `NOCO_*` environment variables.
/// The toggles in here are handed to the driver explicitly; nothing
/// below the CLI reads the process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub node_name: String,
    #[serde(default = "default_host_root")]
    pub host_root: PathBuf,
    #[serde(default)]
    pub host_fs_enabled: bool,
    #[serde(default)]
    pub package_management_enabled: bool,
    #[serde(default = "default_true")]
    pub enforce_node_ready: bool,
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
    /// How often the store is scanned for changed objects and node labels.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_not_ready_backoff")]
    pub not_ready_backoff_secs: u64,
    /// Deadline for one reconciliation pass. 0 disables it.
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_secs: u64,
    #[serde(default = "default_status_retry_attempts")]
    pub status_retry_attempts: u32,
    #[serde(default = "default_status_retry_backoff")]
    pub status_retry_backoff_ms: u64,
    #[serde(default)]
    pub store: StoreConfig,
    /// Static node inventory used for selector evaluation when no
    /// cluster membership source is wired in.
    #[serde(default)]
    pub nodes: Vec<StaticNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNode {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub ready: bool,
}

fn default_host_root() -> PathBuf {
    PathBuf::from("/host")
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/noco/objects")
}

fn default_true() -> bool {
    true
}

fn default_resync_interval() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    10
}

fn default_not_ready_backoff() -> u64 {
    300
}

fn default_pass_timeout() -> u64 {
    900
}

fn default_status_retry_attempts() -> u32 {
    5
}

fn default_status_retry_backoff() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            host_root: default_host_root(),
            host_fs_enabled: false,
            package_management_enabled: false,
            enforce_node_ready: true,
            resync_interval_secs: default_resync_interval(),
            poll_interval_secs: default_poll_interval(),
            not_ready_backoff_secs: default_not_ready_backoff(),
            pass_timeout_secs: default_pass_timeout(),
            status_retry_attempts: default_status_retry_attempts(),
            status_retry_backoff_ms: default_status_retry_backoff(),
            store: StoreConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Reads the file, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Applies `NOCO_*` overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("NOCO_NODE_NAME") {
            self.node_name = name;
        }
        if let Some(root) = lookup("NOCO_HOST_ROOT") {
            self.host_root = PathBuf::from(root);
        }
        if let Some(path) = lookup("NOCO_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(v) = lookup("NOCO_HOSTFS_ENABLED") {
            self.host_fs_enabled = parse_bool("NOCO_HOSTFS_ENABLED", &v)?;
        }
        if let Some(v) = lookup("NOCO_APT_ENABLED") {
            self.package_management_enabled = parse_bool("NOCO_APT_ENABLED", &v)?;
        }
        if let Some(v) = lookup("NOCO_ENFORCE_NODE_READY") {
            self.enforce_node_ready = parse_bool("NOCO_ENFORCE_NODE_READY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::MissingNodeName);
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn not_ready_backoff(&self) -> Duration {
        Duration::from_secs(self.not_ready_backoff_secs)
    }

    pub fn pass_timeout(&self) -> Option<Duration> {
        match self.pass_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn status_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.status_retry_backoff_ms)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_minimal_file() {
        let config = AgentConfig::parse(r#"node_name = "worker-1""#).unwrap();

        assert_eq!(config.node_name, "worker-1");
        assert_eq!(config.host_root, PathBuf::from("/host"));
        assert!(!config.host_fs_enabled);
        assert!(!config.package_management_enabled);
        assert!(config.enforce_node_ready);
        assert_eq!(config.resync_interval(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.status_retry_attempts, 5);
        assert_eq!(config.pass_timeout(), Some(Duration::from_secs(900)));
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_parse_node_inventory() {
        let config = AgentConfig::parse(
            r#"
node_name = "worker-1"
pass_timeout_secs = 0

[store]
path = "/tmp/objects"

[[nodes]]
name = "worker-1"
labels = { "kubernetes.io/hostname" = "worker-1", env = "prod" }

[[nodes]]
name = "worker-2"
ready = false
"#,
        )
        .unwrap();

        assert_eq!(config.pass_timeout(), None);
        assert_eq!(config.store.path, PathBuf::from("/tmp/objects"));
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].labels.get("env").map(String::as_str), Some("prod"));
        assert!(config.nodes[0].ready);
        assert!(!config.nodes[1].ready);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("NOCO_NODE_NAME", "node-a"),
            ("NOCO_HOSTFS_ENABLED", "true"),
            ("NOCO_APT_ENABLED", "1"),
            ("NOCO_ENFORCE_NODE_READY", "no"),
            ("NOCO_HOST_ROOT", "/mnt/host"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node_name, "node-a");
        assert!(config.host_fs_enabled);
        assert!(config.package_management_enabled);
        assert!(!config.enforce_node_ready);
        assert_eq!(config.host_root, PathBuf::from("/mnt/host"));
    }

    #[test]
    fn test_invalid_bool_is_rejected() {
        let mut config = AgentConfig::default();
        let result = config.apply_env(|k| (k == "NOCO_HOSTFS_ENABLED").then(|| "maybe".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_node_name() {
        let config = AgentConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingNodeName)));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            AgentConfig::parse("node_name = "),
            Err(ConfigError::Parse(_))
        ));
    }
}
