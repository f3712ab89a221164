use async_trait::async_trait;
use std::io;
use std::path::PathBuf;

use noco_nodeconfig::{
    Hosts, ModuleKind, ModuleSection, ModuleState, DEFAULT_BEGIN_MARKER, DEFAULT_END_MARKER,
};

use crate::{Artifact, ArtifactOwner, HostContext, Module, ModuleError};

const HOSTS_FILE: &str = "/etc/hosts";

/// `<ip> <hostname>` lines in an owner-scoped block of /etc/hosts.
pub struct HostsModule {
    section: Hosts,
    owner: ArtifactOwner,
}

impl HostsModule {
    pub fn new(section: Hosts, owner: ArtifactOwner) -> Self {
        Self { section, owner }
    }

    pub fn begin_marker(&self) -> String {
        format!("# BEGIN NCO HOSTS {}", self.owner.slug())
    }

    pub fn end_marker(&self) -> String {
        format!("# END NCO HOSTS {}", self.owner.slug())
    }

    fn artifact(&self, host: &HostContext) -> Artifact {
        let block = self
            .section
            .hosts
            .iter()
            .map(|h| format!("{} {}", h.ip, h.hostname))
            .collect::<Vec<_>>()
            .join("\n");
        Artifact::block(host.path(HOSTS_FILE), &self.begin_marker(), &self.end_marker(), block)
    }
}

#[async_trait]
impl Module for HostsModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Hosts
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn legacy_artifacts(&self, host: &HostContext) -> io::Result<Vec<Artifact>> {
        Ok(vec![Artifact::block(
            host.path(HOSTS_FILE),
            DEFAULT_BEGIN_MARKER,
            DEFAULT_END_MARKER,
            "",
        )])
    }

    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        Ok(vec![self.artifact(host)])
    }

    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        vec![self.artifact(host)]
    }

    async fn activate(&self, _host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_host;
    use crate::{reconcile_module, Change};
    use noco_nodeconfig::{HostEntry, ObjectKey};
    use std::fs;
    use tempfile::TempDir;

    fn module(name: &str, entries: &[(&str, &str)], state: ModuleState) -> HostsModule {
        HostsModule::new(
            Hosts {
                hosts: entries
                    .iter()
                    .map(|(ip, hostname)| HostEntry {
                        hostname: hostname.to_string(),
                        ip: ip.to_string(),
                    })
                    .collect(),
                state,
                priority: None,
            },
            ArtifactOwner::new(&ObjectKey::new("infra", name), 50),
        )
    }

    #[tokio::test]
    async fn test_two_owners_share_the_file() {
        let temp = TempDir::new().unwrap();
        let (host, _) = mock_host(temp.path());
        let hosts = temp.path().join("etc/hosts");
        fs::create_dir_all(hosts.parent().unwrap()).unwrap();
        fs::write(&hosts, "127.0.0.1 localhost\n").unwrap();

        let a = module("a", &[("10.0.0.1", "db")], ModuleState::Present);
        let b = module("b", &[("10.0.0.2", "cache")], ModuleState::Present);
        reconcile_module(&a, &host).await.unwrap();
        reconcile_module(&b, &host).await.unwrap();

        assert_eq!(
            fs::read_to_string(&hosts).unwrap(),
            "127.0.0.1 localhost\n\
             # BEGIN NCO HOSTS infra_a\n10.0.0.1 db\n# END NCO HOSTS infra_a\n\
             # BEGIN NCO HOSTS infra_b\n10.0.0.2 cache\n# END NCO HOSTS infra_b\n"
        );

        let a_absent = module("a", &[("10.0.0.1", "db")], ModuleState::Absent);
        assert_eq!(reconcile_module(&a_absent, &host).await.unwrap(), Change::Removed);
        assert_eq!(
            fs::read_to_string(&hosts).unwrap(),
            "127.0.0.1 localhost\n# BEGIN NCO HOSTS infra_b\n10.0.0.2 cache\n# END NCO HOSTS infra_b\n"
        );
        assert_eq!(reconcile_module(&b, &host).await.unwrap(), Change::Unchanged);
    }

    #[tokio::test]
    async fn test_legacy_block_is_replaced() {
        let temp = TempDir::new().unwrap();
        let (host, _) = mock_host(temp.path());
        let hosts = temp.path().join("etc/hosts");
        fs::create_dir_all(hosts.parent().unwrap()).unwrap();
        fs::write(
            &hosts,
            "127.0.0.1 localhost\n# BEGIN MARKER NCO\n10.0.0.9 old\n# END MARKER NCO\n",
        )
        .unwrap();

        let a = module("a", &[("10.0.0.1", "db")], ModuleState::Present);
        assert_eq!(reconcile_module(&a, &host).await.unwrap(), Change::Applied);

        let content = fs::read_to_string(&hosts).unwrap();
        assert!(!content.contains("10.0.0.9 old"));
        assert!(content.contains("10.0.0.1 db"));
    }
}
