use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use noco_nodeconfig::{ModuleKind, ModuleSection, ModuleState, SystemdOverride, SystemdOverrides};

use super::daemon_reload;
use crate::{Artifact, ArtifactOwner, HostContext, Module, ModuleError};

const UNIT_DIR: &str = "/etc/systemd/system";
const LEGACY_FILE: &str = "90-nco-override.conf";
const OVERRIDE_SUFFIX: &str = "-override.conf";
const HEADER: &str = "# FILE MANAGED BY NCO - CHANGES TO THIS FILE WILL BE OVERWRITTEN\n";

/// Drop-in overrides for existing service and slice units.
pub struct SystemdOverridesModule {
    section: SystemdOverrides,
    owner: ArtifactOwner,
}

impl SystemdOverridesModule {
    pub fn new(section: SystemdOverrides, owner: ArtifactOwner) -> Self {
        Self { section, owner }
    }

    fn overrides(&self) -> impl Iterator<Item = &SystemdOverride> {
        self.section.overrides.iter().filter(|o| {
            let supported = o.name.ends_with(".service") || o.name.ends_with(".slice");
            if !supported {
                warn!(unit = %o.name, "unit type not supported for overrides, skipping");
            }
            supported
        })
    }

    /// An override's own priority wins over the section's.
    fn owner_for(&self, o: &SystemdOverride) -> ArtifactOwner {
        match o.priority {
            Some(priority) => self.owner.with_priority(priority),
            None => self.owner.clone(),
        }
    }

    fn drop_in_dir(host: &HostContext, o: &SystemdOverride) -> PathBuf {
        host.path(UNIT_DIR).join(format!("{}.d", o.name))
    }

    fn artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        self.overrides()
            .map(|o| {
                let file = format!("{}{}", self.owner_for(o).file_stem(), OVERRIDE_SUFFIX);
                Artifact::file(Self::drop_in_dir(host, o).join(file), format!("{}{}", HEADER, o.file))
            })
            .collect()
    }

    /// Restarts the services whose drop-in directory contains one of `paths`.
    /// Slices pick up changes for new processes only.
    async fn restart_affected(&self, host: &HostContext, paths: &[PathBuf]) -> Result<(), ModuleError> {
        let units: BTreeSet<&str> = paths.iter().filter_map(|p| unit_of(p)).collect();
        for unit in units.into_iter().filter(|u| u.ends_with(".service")) {
            host.exec(self.kind(), "systemctl", &["restart", unit]).await?;
        }
        Ok(())
    }
}

/// `/etc/systemd/system/foo.service.d/x.conf` -> `foo.service`
fn unit_of(path: &Path) -> Option<&str> {
    path.parent()?.file_name()?.to_str()?.strip_suffix(".d")
}

#[async_trait]
impl Module for SystemdOverridesModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::SystemdOverrides
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn legacy_artifacts(&self, host: &HostContext) -> io::Result<Vec<Artifact>> {
        let mut legacy = Vec::new();
        for o in self.overrides() {
            let dir = Self::drop_in_dir(host, o);
            legacy.push(Artifact::stale(dir.join(LEGACY_FILE)));
            legacy.extend(
                self.owner_for(o)
                    .other_priority_files(&dir, OVERRIDE_SUFFIX)?
                    .into_iter()
                    .map(Artifact::stale),
            );
        }
        Ok(legacy)
    }

    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        Ok(self.artifacts(host))
    }

    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        self.artifacts(host)
    }

    async fn activate(&self, host: &HostContext, changed: &[PathBuf]) -> Result<(), ModuleError> {
        daemon_reload(host, self.kind()).await?;
        self.restart_affected(host, changed).await
    }

    async fn deactivate(&self, host: &HostContext, removed: &[PathBuf]) -> Result<(), ModuleError> {
        daemon_reload(host, self.kind()).await?;
        self.restart_affected(host, removed).await
    }
}
