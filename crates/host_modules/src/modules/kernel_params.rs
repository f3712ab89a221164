use async_trait::async_trait;
use std::io;
use std::path::PathBuf;

use noco_nodeconfig::{KernelParameters, ModuleKind, ModuleSection, ModuleState};

use crate::fsutil::read_optional;
use crate::{Artifact, ArtifactOwner, Failure, HostContext, Module, ModuleError};

const SYSCTL_DIR: &str = "/etc/sysctl.d";
const LEGACY_FILE: &str = "99-nco.conf";

/// sysctl values in `/etc/sysctl.d/<prio>-nco-<owner>.conf`.
pub struct KernelParametersModule {
    section: KernelParameters,
    owner: ArtifactOwner,
}

impl KernelParametersModule {
    pub fn new(section: KernelParameters, owner: ArtifactOwner) -> Self {
        Self { section, owner }
    }

    fn file_name(&self) -> String {
        format!("{}.conf", self.owner.file_stem())
    }

    fn artifact(&self, host: &HostContext) -> Artifact {
        let content: String = self
            .section
            .parameters
            .iter()
            .map(|p| format!("{} = {}\n", p.name, p.value))
            .collect();
        Artifact::file(host.path(SYSCTL_DIR).join(self.file_name()), content)
    }
}

/// sysctl prints multi-value parameters tab separated.
fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Module for KernelParametersModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::KernelParameters
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn legacy_artifacts(&self, host: &HostContext) -> io::Result<Vec<Artifact>> {
        let dir = host.path(SYSCTL_DIR);
        let mut legacy = vec![Artifact::stale(dir.join(LEGACY_FILE))];
        legacy.extend(
            self.owner
                .other_priority_files(&dir, ".conf")?
                .into_iter()
                .map(Artifact::stale),
        );
        Ok(legacy)
    }

    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        Ok(vec![self.artifact(host)])
    }

    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        vec![self.artifact(host)]
    }

    /// Every parameter already has its value in the running kernel.
    async fn is_live(&self, host: &HostContext) -> Result<bool, ModuleError> {
        for param in &self.section.parameters {
            let path = host.proc_path("sys").join(param.name.replace('.', "/"));
            let current = read_optional(&path).map_err(|source| {
                ModuleError::new(self.kind(), Failure::Read { path: path.clone(), source })
            })?;
            match current {
                Some(v) if normalize(&v) == normalize(&param.value) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn activate(&self, host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        let file = format!("{}/{}", SYSCTL_DIR, self.file_name());
        host.exec(self.kind(), "sysctl", &["-p", file.as_str()]).await?;
        Ok(())
    }

    async fn deactivate(&self, host: &HostContext, _removed: &[PathBuf]) -> Result<(), ModuleError> {
        host.exec(self.kind(), "sysctl", &["--system"]).await?;
        Ok(())
    }
}
