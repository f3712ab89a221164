use async_trait::async_trait;
use std::io;
use std::path::PathBuf;

use noco_nodeconfig::{GrubKernelConfig, ModuleKind, ModuleSection, ModuleState};

use crate::fsutil::read_optional;
use crate::{Artifact, ArtifactOwner, Failure, HostContext, Module, ModuleError};

const GRUB_D: &str = "/etc/default/grub.d";
const GRUB_CFG: &str = "/boot/grub/grub.cfg";
const LEGACY_FILE: &str = "99-nco.cfg";
const BEGIN_MARKER: &str = "# BEGIN MARKER NCO GRUB CONFIG";
const END_MARKER: &str = "# END MARKER NCO GRUB CONFIG";
const SUBMENU: &str = "Advanced options for Ubuntu";

/// Kernel command line and default boot entry through a grub.d fragment.
/// Takes effect on the next boot.
pub struct GrubModule {
    section: GrubKernelConfig,
    owner: ArtifactOwner,
}

impl GrubModule {
    pub fn new(section: GrubKernelConfig, owner: ArtifactOwner) -> Self {
        Self { section, owner }
    }

    fn path(&self, host: &HostContext) -> PathBuf {
        host.path(GRUB_D).join(format!("{}.cfg", self.owner.file_stem()))
    }

    fn read(&self, path: PathBuf) -> Result<Option<String>, ModuleError> {
        read_optional(&path).map_err(|source| ModuleError::new(self.kind(), Failure::Read { path, source }))
    }

    /// The GRUB_DEFAULT value booting `version`.
    fn default_entry(&self, host: &HostContext, version: &str) -> Result<String, ModuleError> {
        let precondition = |msg: String| ModuleError::new(self.kind(), Failure::Precondition(msg));

        if !host.path(format!("/boot/vmlinuz-{}", version)).exists() {
            return Err(precondition(format!("kernel version {} is not installed", version)));
        }
        let grub_cfg = self.read(host.path(GRUB_CFG))?.unwrap_or_default();
        let entry = find_menu_entry(&grub_cfg, version).ok_or_else(|| {
            precondition(format!("kernel entry for version {} not found in GRUB menu", version))
        })?;
        Ok(format!("{}>{}", SUBMENU, entry))
    }
}

/// Title of the first non-recovery `menuentry` for `version` in grub.cfg.
pub fn find_menu_entry(grub_cfg: &str, version: &str) -> Option<String> {
    grub_cfg
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let rest = line.strip_prefix("menuentry '")?;
            let end = rest.find('\'')?;
            Some(&rest[..end])
        })
        .filter(|title| !title.contains("recovery mode"))
        .find(|title| mentions_version(title, version))
        .map(str::to_string)
}

/// `5.15.0-1` matches `5.15.0-1-generic` but not `5.15.0-10`.
fn mentions_version(title: &str, version: &str) -> bool {
    if version.is_empty() {
        return false;
    }
    title.match_indices(version).any(|(start, _)| {
        let before = title[..start].chars().next_back();
        let after = title[start + version.len()..].chars().next();
        let glued_before = before.map_or(false, |c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
        let glued_after = after.map_or(false, |c| c.is_ascii_digit() || c == '.');
        !glued_before && !glued_after
    })
}

#[async_trait]
impl Module for GrubModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::GrubKernelConfig
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn legacy_artifacts(&self, host: &HostContext) -> io::Result<Vec<Artifact>> {
        let dir = host.path(GRUB_D);
        let mut legacy = vec![Artifact::stale(dir.join(LEGACY_FILE))];
        legacy.extend(
            self.owner
                .other_priority_files(&dir, ".cfg")?
                .into_iter()
                .map(Artifact::stale),
        );
        Ok(legacy)
    }

    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        let mut lines = Vec::new();
        if !self.section.args.is_empty() {
            lines.push(format!("GRUB_CMDLINE_LINUX=\"{}\"", self.section.args.join(" ")));
        }
        if let Some(version) = self.section.kernel_version() {
            lines.push(format!("GRUB_DEFAULT=\"{}\"", self.default_entry(host, version)?));
        }
        let content = format!("{}\n{}\n{}\n", BEGIN_MARKER, lines.join("\n"), END_MARKER);
        Ok(vec![Artifact::file(self.path(host), content)])
    }

    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        vec![Artifact::stale(self.path(host))]
    }

    async fn activate(&self, host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        host.exec(self.kind(), "update-grub", &[]).await?;
        Ok(())
    }

    async fn deactivate(&self, host: &HostContext, _removed: &[PathBuf]) -> Result<(), ModuleError> {
        host.exec(self.kind(), "update-grub", &[]).await?;
        Ok(())
    }
}
