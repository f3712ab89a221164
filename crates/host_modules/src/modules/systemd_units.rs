use async_trait::async_trait;
use std::path::PathBuf;
use tracing::warn;

use noco_nodeconfig::{ModuleKind, ModuleSection, ModuleState, SystemdUnit, SystemdUnits};

use super::{daemon_reload, is_unit_active};
use crate::{Artifact, Failure, HostContext, Module, ModuleError};

const UNIT_DIR: &str = "/etc/systemd/system";

/// systemctl exit code for "unit not loaded".
const EXIT_UNIT_NOT_LOADED: i32 = 5;

/// Service units under `/etc/systemd/system/nco-<name>.service`.
///
/// Units are named by their declaration, not by owner: the unit name is
/// what operators and other units refer to.
pub struct SystemdUnitsModule {
    section: SystemdUnits,
}

impl SystemdUnitsModule {
    pub fn new(section: SystemdUnits) -> Self {
        Self { section }
    }

    /// Declared units that can be managed, with their unit names.
    /// Timers and sockets are skipped.
    fn units(&self) -> Vec<(String, &SystemdUnit)> {
        self.section
            .units
            .iter()
            .filter_map(|unit| match unit_name(&unit.name) {
                Some(name) => Some((name, unit)),
                None => {
                    warn!(unit = %unit.name, "only service units are supported, skipping");
                    None
                }
            })
            .collect()
    }

    fn artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        self.units()
            .into_iter()
            .map(|(name, unit)| Artifact::file(host.path(UNIT_DIR).join(name), unit.file.as_str()))
            .collect()
    }
}

/// `nco-<name>.service`, or `None` for unit types this module does not run.
pub fn unit_name(declared: &str) -> Option<String> {
    if declared.ends_with(".timer") || declared.ends_with(".socket") {
        return None;
    }
    let base = declared.strip_suffix(".service").unwrap_or(declared);
    Some(format!("nco-{}.service", base))
}

fn file_name(path: &std::path::Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

#[async_trait]
impl Module for SystemdUnitsModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::SystemdUnits
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        Ok(self.artifacts(host))
    }

    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        self.artifacts(host)
    }

    async fn is_live(&self, host: &HostContext) -> Result<bool, ModuleError> {
        for (name, _) in self.units() {
            if !is_unit_active(host, self.kind(), &name).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Restarts units whose file changed or that are not running.
    async fn activate(&self, host: &HostContext, changed: &[PathBuf]) -> Result<(), ModuleError> {
        if !changed.is_empty() {
            daemon_reload(host, self.kind()).await?;
        }
        for (name, _) in self.units() {
            let was_changed = changed.iter().any(|p| file_name(p) == Some(name.as_str()));
            if was_changed || !is_unit_active(host, self.kind(), &name).await? {
                host.exec(self.kind(), "systemctl", &["restart", &name]).await?;
            }
        }
        Ok(())
    }

    async fn verify(&self, host: &HostContext) -> Result<(), ModuleError> {
        for (name, _) in self.units() {
            if !is_unit_active(host, self.kind(), &name).await? {
                return Err(ModuleError::new(
                    self.kind(),
                    Failure::Verification(format!("unit {} is not active after restart", name)),
                ));
            }
        }
        Ok(())
    }

    /// Stops units whose file is still there.
    async fn before_remove(&self, host: &HostContext) -> Result<(), ModuleError> {
        for (name, _) in self.units() {
            if host.path(UNIT_DIR).join(&name).exists() {
                host.exec_accepting(self.kind(), "systemctl", &["stop", &name], &[0, EXIT_UNIT_NOT_LOADED])
                    .await?;
            }
        }
        Ok(())
    }

    async fn deactivate(&self, host: &HostContext, _removed: &[PathBuf]) -> Result<(), ModuleError> {
        daemon_reload(host, self.kind()).await
    }
}
