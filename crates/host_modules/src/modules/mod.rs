//! Concrete modules, one per NodeConfig section.

mod apt;
mod block_in_file;
mod certificates;
mod crontabs;
mod grub;
mod hosts;
mod kernel_modules;
mod kernel_params;
mod systemd_overrides;
mod systemd_units;

pub use apt::{apt_errors, AptModule};
pub use block_in_file::BlockInFileModule;
pub use certificates::CertificatesModule;
pub use crontabs::CrontabsModule;
pub use grub::{find_menu_entry, GrubModule};
pub use hosts::HostsModule;
pub use kernel_modules::KernelModulesModule;
pub use kernel_params::KernelParametersModule;
pub use systemd_overrides::SystemdOverridesModule;
pub use systemd_units::SystemdUnitsModule;

use noco_nodeconfig::{ModuleKind, ModuleSection, NodeConfigSpec, ObjectKey};

use crate::{ArtifactOwner, HostContext, Module, ModuleError};

/// Modules for every declared section of `spec`, in reconciliation order.
/// Sections with an empty payload are left out entirely.
pub fn modules_for(spec: &NodeConfigSpec, key: &ObjectKey) -> Vec<Box<dyn Module>> {
    let owner = |section: &dyn ModuleSection| ArtifactOwner::new(key, section.priority());

    ModuleKind::ALL
        .iter()
        .filter(|kind| spec.section(**kind).is_declared())
        .map(|kind| -> Box<dyn Module> {
            match kind {
                ModuleKind::BlockInFiles => {
                    Box::new(BlockInFileModule::new(spec.block_in_files.clone()))
                }
                ModuleKind::Hosts => {
                    Box::new(HostsModule::new(spec.hosts.clone(), owner(&spec.hosts)))
                }
                ModuleKind::AptPackages => Box::new(AptModule::new(spec.apt_packages.clone())),
                ModuleKind::KernelModules => Box::new(KernelModulesModule::new(
                    spec.kernel_modules.clone(),
                    owner(&spec.kernel_modules),
                )),
                ModuleKind::KernelParameters => Box::new(KernelParametersModule::new(
                    spec.kernel_parameters.clone(),
                    owner(&spec.kernel_parameters),
                )),
                ModuleKind::SystemdUnits => {
                    Box::new(SystemdUnitsModule::new(spec.systemd_units.clone()))
                }
                ModuleKind::Certificates => Box::new(CertificatesModule::new(
                    spec.certificates.clone(),
                    owner(&spec.certificates),
                )),
                ModuleKind::SystemdOverrides => Box::new(SystemdOverridesModule::new(
                    spec.systemd_overrides.clone(),
                    owner(&spec.systemd_overrides),
                )),
                ModuleKind::Crontabs => Box::new(CrontabsModule::new(
                    spec.crontabs.clone(),
                    owner(&spec.crontabs),
                )),
                ModuleKind::GrubKernelConfig => Box::new(GrubModule::new(
                    spec.grub_kernel_config.clone(),
                    owner(&spec.grub_kernel_config),
                )),
            }
        })
        .collect()
}

// ============================================================================
// systemd helpers shared by several modules
// ============================================================================

pub(crate) async fn is_unit_active(
    host: &HostContext,
    module: ModuleKind,
    unit: &str,
) -> Result<bool, ModuleError> {
    let out = host
        .query(module, "systemctl", &["is-active", "--quiet", unit])
        .await?;
    Ok(out.success())
}

pub(crate) async fn daemon_reload(host: &HostContext, module: ModuleKind) -> Result<(), ModuleError> {
    host.exec(module, "systemctl", &["daemon-reload"]).await?;
    Ok(())
}
