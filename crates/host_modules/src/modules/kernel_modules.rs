use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use noco_nodeconfig::{KernelModules, ModuleKind, ModuleSection, ModuleState};

use crate::fsutil::read_optional;
use crate::{Artifact, ArtifactOwner, Failure, HostContext, Module, ModuleError};

const MODULES_LOAD_DIR: &str = "/etc/modules-load.d";
const LEGACY_FILE: &str = "nco.conf";

/// Boot-time module list in modules-load.d plus an immediate modprobe.
///
/// Absent only removes the boot-time list. Modules that are loaded stay
/// loaded until the next reboot.
pub struct KernelModulesModule {
    section: KernelModules,
    owner: ArtifactOwner,
}

impl KernelModulesModule {
    pub fn new(section: KernelModules, owner: ArtifactOwner) -> Self {
        Self { section, owner }
    }

    fn artifact(&self, host: &HostContext) -> Artifact {
        let mut content = self.section.modules.join("\n");
        content.push('\n');
        Artifact::file(
            host.path(MODULES_LOAD_DIR)
                .join(format!("{}.conf", self.owner.file_stem())),
            content,
        )
    }

    async fn loaded_modules(&self, host: &HostContext) -> Result<HashSet<String>, ModuleError> {
        let path = host.proc_path("modules");
        let content = read_optional(&path)
            .map_err(|source| ModuleError::new(self.kind(), Failure::Read { path, source }))?
            .unwrap_or_default();
        Ok(content
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }
}

/// The kernel reports `-` in module names as `_`.
fn kernel_name(module: &str) -> String {
    module.replace('-', "_")
}

#[async_trait]
impl Module for KernelModulesModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::KernelModules
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn legacy_artifacts(&self, host: &HostContext) -> io::Result<Vec<Artifact>> {
        let dir = host.path(MODULES_LOAD_DIR);
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

    async fn is_live(&self, host: &HostContext) -> Result<bool, ModuleError> {
        let loaded = self.loaded_modules(host).await?;
        Ok(self
            .section
            .modules
            .iter()
            .all(|m| loaded.contains(&kernel_name(m))))
    }

    async fn activate(&self, host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        for module in &self.section.modules {
            host.exec(self.kind(), "modprobe", &[module.as_str()]).await?;
        }
        Ok(())
    }
}
