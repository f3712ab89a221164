use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

use noco_nodeconfig::{AptPackages, ModuleKind, ModuleSection, ModuleState};

use crate::{Artifact, CommandOutput, Failure, HostContext, Module, ModuleError};

const DPKG_FORMAT: &str = r"-f=${Package} ${Status} ${Version}\n";

/// Package installation through apt-get. Packages are never removed:
/// absent is a no-op.
pub struct AptModule {
    section: AptPackages,
}

impl AptModule {
    pub fn new(section: AptPackages) -> Self {
        Self { section }
    }

    /// Installed packages and their versions, as dpkg reports them.
    async fn installed(&self, host: &HostContext) -> Result<HashMap<String, String>, ModuleError> {
        let mut args = vec!["-W", DPKG_FORMAT];
        args.extend(self.section.packages.iter().map(|p| p.name.as_str()));
        // dpkg-query exits 1 when any package is unknown but still lists the others.
        let out = host.query(self.kind(), "dpkg-query", &args).await?;
        Ok(parse_dpkg_status(&out.stdout))
    }

    async fn apt_get(&self, host: &HostContext, args: &[&str]) -> Result<(), ModuleError> {
        let out = host.query(self.kind(), "apt-get", args).await?;
        if out.success() {
            return Ok(());
        }
        Err(ModuleError::new(
            self.kind(),
            Failure::Command {
                command: format!("apt-get {}", args.join(" ")),
                detail: apt_errors(&out),
            },
        ))
    }
}

fn parse_dpkg_status(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let status: Vec<_> = fields.by_ref().take(3).collect();
            if status != ["install", "ok", "installed"] {
                return None;
            }
            let version = fields.next().unwrap_or("");
            Some((name.to_string(), version.to_string()))
        })
        .collect()
}

/// The `E:` lines of an apt-get run, or its whole output if there are none.
pub fn apt_errors(output: &CommandOutput) -> String {
    let combined = output.combined();
    let errors: Vec<_> = combined
        .lines()
        .filter(|line| line.starts_with("E:"))
        .collect();
    if errors.is_empty() {
        format!("apt errors: {}", combined.trim())
    } else {
        format!("apt errors: {}", errors.join(" "))
    }
}

#[async_trait]
impl Module for AptModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::AptPackages
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn soft_precondition(&self, host: &HostContext) -> Option<String> {
        if !host.host_fs_enabled {
            Some("package management needs the host filesystem".to_string())
        } else if !host.package_management_enabled {
            Some("package management is disabled".to_string())
        } else {
            None
        }
    }

    async fn desired_artifacts(&self, _host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        Ok(Vec::new())
    }

    fn owned_artifacts(&self, _host: &HostContext) -> Vec<Artifact> {
        Vec::new()
    }

    async fn is_live(&self, host: &HostContext) -> Result<bool, ModuleError> {
        let installed = self.installed(host).await?;
        Ok(self.section.packages.iter().all(|p| {
            match (installed.get(&p.name), p.version.as_deref()) {
                (None, _) => false,
                (Some(have), Some(want)) if !want.is_empty() => have == want,
                (Some(_), _) => true,
            }
        }))
    }

    async fn activate(&self, host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        self.apt_get(host, &["update", "-y"]).await?;

        let packages: Vec<String> = self.section.packages.iter().map(|p| p.install_arg()).collect();
        let mut args = vec!["install", "-y", "--allow-downgrades"];
        args.extend(packages.iter().map(String::as_str));
        self.apt_get(host, &args).await
    }
}
