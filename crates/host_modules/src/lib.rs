use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use noco_nodeconfig::{ModuleKind, ModuleState};

pub mod artifact;
pub mod fsutil;
pub mod marker;
pub mod modules;
pub mod ownership;
pub mod runner;

pub use artifact::Artifact;
pub use modules::modules_for;
pub use ownership::ArtifactOwner;
pub use runner::{ChrootRunner, CommandOutput, CommandRunner};

// ============================================================================
// Errors
// ============================================================================

/// A module failure, always attributed to the module that raised it.
#[derive(Debug, Error)]
#[error("{module}: {source}")]
pub struct ModuleError {
    pub module: ModuleKind,
    pub source: Failure,
}

impl ModuleError {
    pub fn new(module: ModuleKind, source: Failure) -> Self {
        Self { module, source }
    }
}

#[derive(Debug, Error)]
pub enum Failure {
    #[error("host filesystem is not available")]
    HostFsUnavailable,

    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to run {command}: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("{0}")]
    Verification(String),

    #[error("{0}")]
    Precondition(String),
}

// ============================================================================
// Host context
// ============================================================================

/// Everything a module needs to reach the host: where its filesystem is
/// mounted, how to run commands in it, and the feature toggles.
#[derive(Clone)]
pub struct HostContext {
    root: PathBuf,
    proc_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    pub host_fs_enabled: bool,
    pub package_management_enabled: bool,
}

impl HostContext {
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            proc_root: PathBuf::from("/proc"),
            runner,
            host_fs_enabled: true,
            package_management_enabled: false,
        }
    }

    pub fn with_host_fs(mut self, enabled: bool) -> Self {
        self.host_fs_enabled = enabled;
        self
    }

    pub fn with_package_management(mut self, enabled: bool) -> Self {
        self.package_management_enabled = enabled;
        self
    }

    /// Kernel state (`/proc/sys`, `/proc/modules`) is read from here.
    /// It is the same kernel whether seen from the host or the agent.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an absolute host path below the host root.
    pub fn path(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let rel = host_path.as_ref().strip_prefix("/").unwrap_or(host_path.as_ref());
        self.root.join(rel)
    }

    pub fn proc_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.proc_root.join(rel)
    }

    /// Runs a command and returns its output whatever the exit code.
    pub async fn query(
        &self,
        module: ModuleKind,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput, ModuleError> {
        self.runner.run(program, args).await.map_err(|source| {
            ModuleError::new(
                module,
                Failure::Spawn {
                    command: command_line(program, args),
                    source,
                },
            )
        })
    }

    /// Runs a command that must exit with one of `accepted` codes.
    pub async fn exec_accepting(
        &self,
        module: ModuleKind,
        program: &str,
        args: &[&str],
        accepted: &[i32],
    ) -> Result<CommandOutput, ModuleError> {
        let output = self.query(module, program, args).await?;
        match output.code {
            Some(code) if accepted.contains(&code) => Ok(output),
            code => Err(ModuleError::new(
                module,
                Failure::Command {
                    command: command_line(program, args),
                    detail: match code {
                        Some(c) => format!("exit code {}: {}", c, output.combined()),
                        None => format!("killed by signal: {}", output.combined()),
                    },
                },
            )),
        }
    }

    /// Runs a command that must succeed.
    pub async fn exec(
        &self,
        module: ModuleKind,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput, ModuleError> {
        self.exec_accepting(module, program, args, &[0]).await
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Module trait
// ============================================================================

/// What a reconciliation did to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    Applied,
    Removed,
    /// Soft precondition not met, nothing touched.
    Skipped,
}

/// One capability unit with a present/absent contract.
///
/// Implementations describe their artifacts and side effects; the
/// compare / write / activate / verify sequence lives in
/// [`reconcile_module`] and is the same for every module.
#[async_trait]
pub trait Module: Send + Sync {
    fn kind(&self) -> ModuleKind;

    fn state(&self) -> ModuleState;

    /// Declared with a non-empty payload and `state == present`.
    fn is_present(&self) -> bool;

    /// A reason to skip this module without failing the pass.
    fn soft_precondition(&self, _host: &HostContext) -> Option<String> {
        None
    }

    /// Artifacts from the single-owner naming scheme and this owner's
    /// artifacts under other priorities. Purged before every pass.
    fn legacy_artifacts(&self, _host: &HostContext) -> io::Result<Vec<Artifact>> {
        Ok(Vec::new())
    }

    /// Desired artifacts. May check preconditions on the host.
    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError>;

    /// Artifacts to delete when the module is absent.
    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact>;

    /// Liveness beyond file contents (unit active, module loaded).
    async fn is_live(&self, _host: &HostContext) -> Result<bool, ModuleError> {
        Ok(true)
    }

    /// Side effect after writing. `changed` holds host-root paths that
    /// were written or purged.
    async fn activate(&self, host: &HostContext, changed: &[PathBuf]) -> Result<(), ModuleError>;

    async fn verify(&self, _host: &HostContext) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn before_remove(&self, _host: &HostContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Side effect after deleting. Only called if something was removed.
    async fn deactivate(&self, _host: &HostContext, _removed: &[PathBuf]) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Drives one module to its declared state.
pub async fn reconcile_module(module: &dyn Module, host: &HostContext) -> Result<Change, ModuleError> {
    let kind = module.kind();

    if let Some(reason) = module.soft_precondition(host) {
        warn!(module = %kind, "{}, skipping module", reason);
        return Ok(Change::Skipped);
    }
    if !host.host_fs_enabled {
        return Err(ModuleError::new(kind, Failure::HostFsUnavailable));
    }

    let migrated = migrate_ownership(module, host)?;

    let change = match module.state() {
        ModuleState::Present => apply(module, host, migrated).await?,
        ModuleState::Absent => remove(module, host, migrated).await?,
    };
    debug!(module = %kind, ?change, "module reconciled");
    Ok(change)
}

/// Removes legacy artifacts, returning what was deleted.
fn migrate_ownership(module: &dyn Module, host: &HostContext) -> Result<Vec<PathBuf>, ModuleError> {
    let kind = module.kind();
    let legacy = module.legacy_artifacts(host).map_err(|source| {
        ModuleError::new(
            kind,
            Failure::Read {
                path: host.root().to_path_buf(),
                source,
            },
        )
    })?;

    let mut removed = Vec::new();
    for artifact in legacy {
        let existed = artifact.remove().map_err(|source| write_error(kind, &artifact, source))?;
        if existed {
            info!(module = %kind, path = %artifact.path().display(), "removed legacy artifact");
            removed.push(artifact.path().to_path_buf());
        }
    }
    Ok(removed)
}

async fn apply(
    module: &dyn Module,
    host: &HostContext,
    migrated: Vec<PathBuf>,
) -> Result<Change, ModuleError> {
    let kind = module.kind();
    let artifacts = module.desired_artifacts(host).await?;

    let mut outdated = false;
    for artifact in &artifacts {
        if pending(kind, artifact)?.is_some() {
            outdated = true;
            break;
        }
    }

    if !outdated && migrated.is_empty() && module.is_live(host).await? {
        return Ok(Change::Unchanged);
    }

    // Several blocks may share one file, so each artifact is diffed against
    // the file as the previous write left it.
    let mut changed = migrated;
    for artifact in &artifacts {
        let Some(content) = pending(kind, artifact)? else {
            continue;
        };
        artifact
            .write(&content)
            .map_err(|source| write_error(kind, artifact, source))?;
        if !changed.iter().any(|path| path == artifact.path()) {
            changed.push(artifact.path().to_path_buf());
        }
    }

    module.activate(host, &changed).await?;
    module.verify(host).await?;
    Ok(Change::Applied)
}

async fn remove(
    module: &dyn Module,
    host: &HostContext,
    migrated: Vec<PathBuf>,
) -> Result<Change, ModuleError> {
    let kind = module.kind();
    module.before_remove(host).await?;

    let mut removed = migrated;
    for artifact in module.owned_artifacts(host) {
        if artifact.remove().map_err(|source| write_error(kind, &artifact, source))? {
            removed.push(artifact.path().to_path_buf());
        }
    }

    if removed.is_empty() {
        return Ok(Change::Unchanged);
    }
    module.deactivate(host, &removed).await?;
    Ok(Change::Removed)
}

fn pending(kind: ModuleKind, artifact: &Artifact) -> Result<Option<String>, ModuleError> {
    artifact.pending().map_err(|source| {
        ModuleError::new(
            kind,
            Failure::Read {
                path: artifact.path().to_path_buf(),
                source,
            },
        )
    })
}

fn write_error(kind: ModuleKind, artifact: &Artifact, source: io::Error) -> ModuleError {
    ModuleError::new(
        kind,
        Failure::Write {
            path: artifact.path().to_path_buf(),
            source,
        },
    )
}

// ============================================================================
// Test Utilities
// ============================================================================

pub mod test_utils {
    use super::*;
    use std::sync::Mutex;

    /// Records every command and answers with canned output.
    #[derive(Default)]
    pub struct MockRunner {
        calls: Mutex<Vec<String>>,
        responses: Mutex<Vec<(String, CommandOutput)>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Commands whose command line starts with `prefix` get `output`.
        /// The most recently added matching rule wins; unmatched commands
        /// succeed with empty output.
        pub fn respond(&self, prefix: &str, output: CommandOutput) {
            self.responses.lock().unwrap().push((prefix.to_string(), output));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with(prefix))
                .collect()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
            let line = command_line(program, args);
            self.calls.lock().unwrap().push(line.clone());

            let responses = self.responses.lock().unwrap();
            let output = responses
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_else(|| CommandOutput::ok(""));
            Ok(output)
        }
    }

    /// Host context rooted at `root` with `<root>/proc` as proc root and
    /// every toggle enabled.
    pub fn mock_host(root: &Path) -> (HostContext, Arc<MockRunner>) {
        let runner = Arc::new(MockRunner::new());
        let host = HostContext::new(root, runner.clone())
            .with_proc_root(root.join("proc"))
            .with_package_management(true);
        (host, runner)
    }

    /// Commands that change host state, ignoring read-only queries.
    pub fn mutating_calls(runner: &MockRunner) -> Vec<String> {
        runner
            .calls()
            .into_iter()
            .filter(|c| !c.starts_with("systemctl is-active") && !c.starts_with("dpkg-query"))
            .collect()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
