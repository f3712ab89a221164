//! Module payload sections of a NodeConfig spec.
//!
//! Every section carries a `state` and an optional `priority`. A section
//! with an empty payload is not declared at all: the driver skips it
//! instead of reconciling it as absent.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::selector::NodeSelector;

pub const DEFAULT_PRIORITY: u8 = 50;
pub const MAX_PRIORITY: u8 = 99;

pub const DEFAULT_BEGIN_MARKER: &str = "# BEGIN MARKER NCO";
pub const DEFAULT_END_MARKER: &str = "# END MARKER NCO";

/// Module types in reconciliation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleKind {
    BlockInFiles,
    Hosts,
    AptPackages,
    KernelModules,
    KernelParameters,
    SystemdUnits,
    Certificates,
    SystemdOverrides,
    Crontabs,
    GrubKernelConfig,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 10] = [
        ModuleKind::BlockInFiles,
        ModuleKind::Hosts,
        ModuleKind::AptPackages,
        ModuleKind::KernelModules,
        ModuleKind::KernelParameters,
        ModuleKind::SystemdUnits,
        ModuleKind::Certificates,
        ModuleKind::SystemdOverrides,
        ModuleKind::Crontabs,
        ModuleKind::GrubKernelConfig,
    ];

    /// Key of the section in the spec document.
    pub fn key(&self) -> &'static str {
        match self {
            ModuleKind::BlockInFiles => "blockInFiles",
            ModuleKind::Hosts => "hosts",
            ModuleKind::AptPackages => "aptPackages",
            ModuleKind::KernelModules => "kernelModules",
            ModuleKind::KernelParameters => "kernelParameters",
            ModuleKind::SystemdUnits => "systemdUnits",
            ModuleKind::Certificates => "certificates",
            ModuleKind::SystemdOverrides => "systemdOverrides",
            ModuleKind::Crontabs => "crontabs",
            ModuleKind::GrubKernelConfig => "grubKernelConfig",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    #[default]
    Present,
    Absent,
}

/// Common view over every module section.
pub trait ModuleSection {
    fn kind(&self) -> ModuleKind;
    fn state(&self) -> ModuleState;
    /// Priority as written, before defaulting.
    fn declared_priority(&self) -> Option<u8>;
    /// Whether the payload is non-empty.
    fn is_declared(&self) -> bool;

    fn priority(&self) -> u8 {
        self.declared_priority().unwrap_or(DEFAULT_PRIORITY)
    }

    /// Non-empty payload and `state == present`. Pure, never touches the host.
    fn is_present(&self) -> bool {
        self.is_declared() && self.state() == ModuleState::Present
    }
}

macro_rules! list_section {
    ($ty:ident, $kind:ident, $field:ident) => {
        impl ModuleSection for $ty {
            fn kind(&self) -> ModuleKind {
                ModuleKind::$kind
            }
            fn state(&self) -> ModuleState {
                self.state
            }
            fn declared_priority(&self) -> Option<u8> {
                self.priority
            }
            fn is_declared(&self) -> bool {
                !self.$field.is_empty()
            }
        }
    };
}

// ============================================================================
// Payload types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInFiles {
    #[serde(default)]
    pub blocks: Vec<BlockInFile>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInFile {
    /// Absolute path on the host.
    pub filename: String,
    pub content: String,
    #[serde(default = "default_begin_marker")]
    pub begin_marker: String,
    #[serde(default = "default_end_marker")]
    pub end_marker: String,
}

fn default_begin_marker() -> String {
    DEFAULT_BEGIN_MARKER.to_string()
}

fn default_end_marker() -> String {
    DEFAULT_END_MARKER.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hosts {
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEntry {
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AptPackages {
    #[serde(default)]
    pub packages: Vec<AptPackage>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AptPackage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl AptPackage {
    /// `name` or `name=version`, as apt-get expects it.
    pub fn install_arg(&self) -> String {
        match &self.version {
            Some(v) if !v.is_empty() => format!("{}={}", self.name, v),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelModules {
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelParameters {
    #[serde(default)]
    pub parameters: Vec<KernelParameter>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemdUnits {
    #[serde(default)]
    pub units: Vec<SystemdUnit>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemdUnit {
    pub name: String,
    /// Full unit file content.
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificates {
    #[serde(default)]
    pub certificates: Vec<Certificate>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemdOverrides {
    #[serde(default)]
    pub overrides: Vec<SystemdOverride>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemdOverride {
    /// Unit name, must end in `.service` or `.slice`.
    pub name: String,
    pub file: String,
    /// Overrides the section priority for this drop-in only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crontabs {
    #[serde(default)]
    pub entries: Vec<Crontab>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

pub const SPECIAL_TIMES: [&str; 7] = [
    "reboot", "yearly", "annually", "monthly", "weekly", "daily", "hourly",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crontab {
    pub name: String,
    #[serde(default, alias = "special_time", skip_serializing_if = "Option::is_none")]
    pub special_time: Option<String>,
    #[serde(default = "any_field")]
    pub minute: String,
    #[serde(default = "any_field")]
    pub hour: String,
    #[serde(default = "any_field")]
    pub day_of_month: String,
    #[serde(default = "any_field")]
    pub month: String,
    #[serde(default = "any_field")]
    pub day_of_week: String,
    pub job: String,
    pub user: String,
}

fn any_field() -> String {
    "*".to_string()
}

impl Crontab {
    /// The single line written to the cron.d file.
    pub fn line(&self) -> String {
        match self.special_time.as_deref() {
            Some(special) if !special.is_empty() => {
                format!("@{} {} {} # {}", special, self.user, self.job, self.name)
            }
            _ => format!(
                "{} {} {} {} {} {} {} # {}",
                self.minute,
                self.hour,
                self.day_of_month,
                self.month,
                self.day_of_week,
                self.user,
                self.job,
                self.name
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrubKernelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

impl GrubKernelConfig {
    pub fn kernel_version(&self) -> Option<&str> {
        self.kernel_version.as_deref().filter(|v| !v.is_empty())
    }
}

list_section!(BlockInFiles, BlockInFiles, blocks);
list_section!(Hosts, Hosts, hosts);
list_section!(AptPackages, AptPackages, packages);
list_section!(KernelModules, KernelModules, modules);
list_section!(KernelParameters, KernelParameters, parameters);
list_section!(SystemdUnits, SystemdUnits, units);
list_section!(Certificates, Certificates, certificates);
list_section!(SystemdOverrides, SystemdOverrides, overrides);
list_section!(Crontabs, Crontabs, entries);

impl ModuleSection for GrubKernelConfig {
    fn kind(&self) -> ModuleKind {
        ModuleKind::GrubKernelConfig
    }
    fn state(&self) -> ModuleState {
        self.state
    }
    fn declared_priority(&self) -> Option<u8> {
        self.priority
    }
    fn is_declared(&self) -> bool {
        self.kernel_version().is_some() || !self.args.is_empty()
    }
}

// ============================================================================
// Spec
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub node_selector: NodeSelector,
    #[serde(default)]
    pub block_in_files: BlockInFiles,
    #[serde(default)]
    pub hosts: Hosts,
    #[serde(default)]
    pub apt_packages: AptPackages,
    #[serde(default)]
    pub kernel_modules: KernelModules,
    #[serde(default)]
    pub kernel_parameters: KernelParameters,
    #[serde(default)]
    pub systemd_units: SystemdUnits,
    #[serde(default)]
    pub certificates: Certificates,
    #[serde(default)]
    pub systemd_overrides: SystemdOverrides,
    #[serde(default)]
    pub crontabs: Crontabs,
    #[serde(default)]
    pub grub_kernel_config: GrubKernelConfig,
}

impl NodeConfigSpec {
    /// All sections in reconciliation order, declared or not.
    pub fn sections(&self) -> [&dyn ModuleSection; 10] {
        [
            &self.block_in_files,
            &self.hosts,
            &self.apt_packages,
            &self.kernel_modules,
            &self.kernel_parameters,
            &self.systemd_units,
            &self.certificates,
            &self.systemd_overrides,
            &self.crontabs,
            &self.grub_kernel_config,
        ]
    }

    pub fn section(&self, kind: ModuleKind) -> &dyn ModuleSection {
        match kind {
            ModuleKind::BlockInFiles => &self.block_in_files,
            ModuleKind::Hosts => &self.hosts,
            ModuleKind::AptPackages => &self.apt_packages,
            ModuleKind::KernelModules => &self.kernel_modules,
            ModuleKind::KernelParameters => &self.kernel_parameters,
            ModuleKind::SystemdUnits => &self.systemd_units,
            ModuleKind::Certificates => &self.certificates,
            ModuleKind::SystemdOverrides => &self.systemd_overrides,
            ModuleKind::Crontabs => &self.crontabs,
            ModuleKind::GrubKernelConfig => &self.grub_kernel_config,
        }
    }

    pub fn declared_modules(&self) -> Vec<ModuleKind> {
        self.sections()
            .iter()
            .filter(|s| s.is_declared())
            .map(|s| s.kind())
            .collect()
    }

    pub fn present_modules(&self) -> Vec<ModuleKind> {
        self.sections()
            .iter()
            .filter(|s| s.is_present())
            .map(|s| s.kind())
            .collect()
    }
}
