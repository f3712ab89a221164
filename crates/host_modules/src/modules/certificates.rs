use async_trait::async_trait;
use std::io;
use std::path::PathBuf;

use noco_nodeconfig::{Certificates, ModuleKind, ModuleSection, ModuleState};

use crate::fsutil::{read_optional, remove_dir_if_empty};
use crate::{Artifact, ArtifactOwner, Failure, HostContext, Module, ModuleError};

const CA_DIR: &str = "/usr/local/share/ca-certificates";
const CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Trusted CA certificates, one directory per owner below the local CA
/// store.
pub struct CertificatesModule {
    section: Certificates,
    owner: ArtifactOwner,
}

impl CertificatesModule {
    pub fn new(section: Certificates, owner: ArtifactOwner) -> Self {
        Self { section, owner }
    }

    fn owner_dir(&self, host: &HostContext) -> PathBuf {
        host.path(CA_DIR).join(format!("nco-{}", self.owner.slug()))
    }

    fn artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        let dir = self.owner_dir(host);
        self.section
            .certificates
            .iter()
            .map(|c| Artifact::file(dir.join(&c.filename), c.content.as_str()))
            .collect()
    }
}

#[async_trait]
impl Module for CertificatesModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Certificates
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn legacy_artifacts(&self, host: &HostContext) -> io::Result<Vec<Artifact>> {
        let dir = host.path(CA_DIR);
        Ok(self
            .section
            .certificates
            .iter()
            .map(|c| Artifact::stale(dir.join(&c.filename)))
            .collect())
    }

    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        Ok(self.artifacts(host))
    }

    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        self.artifacts(host)
    }

    /// Every certificate made it into the generated bundle.
    async fn is_live(&self, host: &HostContext) -> Result<bool, ModuleError> {
        let path = host.path(CA_BUNDLE);
        let bundle = read_optional(&path)
            .map_err(|source| ModuleError::new(self.kind(), Failure::Read { path, source }))?
            .unwrap_or_default();
        Ok(self
            .section
            .certificates
            .iter()
            .all(|c| bundle.contains(c.content.trim())))
    }

    async fn activate(&self, host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        host.exec(self.kind(), "update-ca-certificates", &[]).await?;
        Ok(())
    }

    async fn deactivate(&self, host: &HostContext, _removed: &[PathBuf]) -> Result<(), ModuleError> {
        host.exec(self.kind(), "update-ca-certificates", &["--fresh"]).await?;
        let dir = self.owner_dir(host);
        remove_dir_if_empty(&dir)
            .map_err(|source| ModuleError::new(self.kind(), Failure::Write { path: dir, source }))
    }
}
