//! Admission checks: spec validation and the module conflict check.

use std::path::{Component, Path};
use thiserror::Error;

use crate::selector::SelectorError;
use crate::spec::{
    ModuleKind, NodeConfigSpec, DEFAULT_BEGIN_MARKER, DEFAULT_END_MARKER, MAX_PRIORITY, SPECIAL_TIMES,
};
use crate::NodeConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{module} module already defined in {namespace}/{name}")]
    Conflict {
        module: ModuleKind,
        namespace: String,
        name: String,
    },

    #[error("{module}: priority {priority} is out of range 0-{max}", max = MAX_PRIORITY)]
    PriorityOutOfRange { module: ModuleKind, priority: u8 },

    #[error("invalid nodeSelector: {0}")]
    Selector(#[from] SelectorError),

    #[error("{module}: {message}")]
    InvalidField { module: ModuleKind, message: String },
}

fn invalid(module: ModuleKind, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        module,
        message: message.into(),
    }
}

/// Full admission check for a create or update.
pub fn admit(candidate: &NodeConfig, existing: &[NodeConfig]) -> Result<(), ValidationError> {
    validate_spec(&candidate.spec)?;
    check_conflicts(candidate, existing)
}

/// Rejects `candidate` if another object with an identical selector already
/// declares one of its present modules.
///
/// Selectors are compared by canonical string only. A selector that merely
/// overlaps another one (for example the empty all-nodes selector against
/// `env in (prod)`) is not reported.
pub fn check_conflicts(candidate: &NodeConfig, existing: &[NodeConfig]) -> Result<(), ValidationError> {
    let selector = candidate.spec.node_selector.canonical();
    let present = candidate.spec.present_modules();
    if present.is_empty() {
        return Ok(());
    }

    for other in existing {
        if other.key() == candidate.key() || other.is_deleting() {
            continue;
        }
        if other.spec.node_selector.canonical() != selector {
            continue;
        }
        if let Some(module) = present
            .iter()
            .find(|kind| other.spec.section(**kind).is_present())
        {
            return Err(ValidationError::Conflict {
                module: *module,
                namespace: other.metadata.namespace.clone(),
                name: other.metadata.name.clone(),
            });
        }
    }

    Ok(())
}

pub fn validate_spec(spec: &NodeConfigSpec) -> Result<(), ValidationError> {
    spec.node_selector.validate()?;

    for section in spec.sections() {
        if let Some(priority) = section.declared_priority() {
            if priority > MAX_PRIORITY {
                return Err(ValidationError::PriorityOutOfRange {
                    module: section.kind(),
                    priority,
                });
            }
        }
    }

    for block in &spec.block_in_files.blocks {
        check_host_path(ModuleKind::BlockInFiles, &block.filename)?;
        if block.begin_marker.is_empty() || block.begin_marker == block.end_marker {
            return Err(invalid(
                ModuleKind::BlockInFiles,
                format!("{}: begin and end markers must be distinct and non-empty", block.filename),
            ));
        }
        // The hosts module purges the default-marker block from /etc/hosts.
        let default_markers =
            block.begin_marker == DEFAULT_BEGIN_MARKER || block.end_marker == DEFAULT_END_MARKER;
        if default_markers && Path::new(&block.filename) == Path::new(HOSTS_FILE) {
            return Err(invalid(
                ModuleKind::BlockInFiles,
                format!("{}: blocks in {} need their own markers", block.filename, HOSTS_FILE),
            ));
        }
    }

    for host in &spec.hosts.hosts {
        if host.hostname.trim().is_empty() || host.ip.trim().is_empty() {
            return Err(invalid(ModuleKind::Hosts, "hostname and ip are required"));
        }
    }

    for param in &spec.kernel_parameters.parameters {
        if param.name.is_empty() || param.name.contains('/') || param.name.contains("..") {
            return Err(invalid(
                ModuleKind::KernelParameters,
                format!("invalid parameter name {:?}", param.name),
            ));
        }
    }

    for cert in &spec.certificates.certificates {
        if !is_plain_file_name(&cert.filename) {
            return Err(invalid(
                ModuleKind::Certificates,
                format!("invalid certificate filename {:?}", cert.filename),
            ));
        }
    }

    for unit in &spec.systemd_units.units {
        if !is_plain_file_name(&unit.name) {
            return Err(invalid(
                ModuleKind::SystemdUnits,
                format!("invalid unit name {:?}", unit.name),
            ));
        }
    }

    for ov in &spec.systemd_overrides.overrides {
        if !(ov.name.ends_with(".service") || ov.name.ends_with(".slice")) || !is_plain_file_name(&ov.name) {
            return Err(invalid(
                ModuleKind::SystemdOverrides,
                format!("{:?} must be a .service or .slice unit", ov.name),
            ));
        }
        if let Some(priority) = ov.priority {
            if priority > MAX_PRIORITY {
                return Err(ValidationError::PriorityOutOfRange {
                    module: ModuleKind::SystemdOverrides,
                    priority,
                });
            }
        }
    }

    for entry in &spec.crontabs.entries {
        if entry.name.trim().is_empty() || entry.job.trim().is_empty() || entry.user.trim().is_empty() {
            return Err(invalid(ModuleKind::Crontabs, "name, job and user are required"));
        }
        let text = [&entry.name, &entry.job, &entry.user];
        if text.iter().any(|f| f.contains(['\n', '\r'])) {
            return Err(invalid(
                ModuleKind::Crontabs,
                format!("{:?}: fields must be single-line", entry.name),
            ));
        }
        let schedule = [
            &entry.minute,
            &entry.hour,
            &entry.day_of_month,
            &entry.month,
            &entry.day_of_week,
            &entry.user,
        ];
        if schedule.iter().any(|f| f.contains(char::is_whitespace)) {
            return Err(invalid(
                ModuleKind::Crontabs,
                format!("{:?}: schedule fields and user must not contain whitespace", entry.name),
            ));
        }
        if let Some(special) = entry.special_time.as_deref().filter(|s| !s.is_empty()) {
            if !SPECIAL_TIMES.contains(&special) {
                return Err(invalid(
                    ModuleKind::Crontabs,
                    format!("{}: unknown special time {:?}", entry.name, special),
                ));
            }
        }
    }

    Ok(())
}

const HOSTS_FILE: &str = "/etc/hosts";

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Host paths must be absolute and must not climb out of the host root.
fn check_host_path(module: ModuleKind, path: &str) -> Result<(), ValidationError> {
    let p = Path::new(path);
    let escapes = p.components().any(|c| matches!(c, Component::ParentDir));
    if !p.is_absolute() || escapes {
        return Err(invalid(module, format!("{:?} must be an absolute path without '..'", path)));
    }
    Ok(())
}
