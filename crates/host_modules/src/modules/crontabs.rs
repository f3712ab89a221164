use async_trait::async_trait;
use std::io;
use std::path::PathBuf;

use noco_nodeconfig::{Crontabs, ModuleKind, ModuleSection, ModuleState};

use super::is_unit_active;
use crate::ownership::cron_file_name;
use crate::{Artifact, ArtifactOwner, Failure, HostContext, Module, ModuleError};

const CRON_DIR: &str = "/etc/cron.d";
const CRON_SERVICE: &str = "cron";

/// One `/etc/cron.d` file per entry. cron rereads the directory itself,
/// the module only makes sure the daemon runs.
pub struct CrontabsModule {
    section: Crontabs,
    owner: ArtifactOwner,
}

impl CrontabsModule {
    pub fn new(section: Crontabs, owner: ArtifactOwner) -> Self {
        Self { section, owner }
    }

    fn artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        let dir = host.path(CRON_DIR);
        let prefix = format!("nco_{}", self.owner.cron_slug());
        self.section
            .entries
            .iter()
            .map(|entry| {
                let file = format!("{}_{}", prefix, cron_file_name(&entry.name));
                Artifact::file(dir.join(file), format!("{}\n", entry.line()))
            })
            .collect()
    }
}

#[async_trait]
impl Module for CrontabsModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Crontabs
    }

    fn state(&self) -> ModuleState {
        self.section.state
    }

    fn is_present(&self) -> bool {
        self.section.is_present()
    }

    fn legacy_artifacts(&self, host: &HostContext) -> io::Result<Vec<Artifact>> {
        let dir = host.path(CRON_DIR);
        Ok(self
            .section
            .entries
            .iter()
            .map(|entry| Artifact::stale(dir.join(cron_file_name(&entry.name))))
            .collect())
    }

    async fn desired_artifacts(&self, host: &HostContext) -> Result<Vec<Artifact>, ModuleError> {
        Ok(self.artifacts(host))
    }

    fn owned_artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        self.artifacts(host)
    }

    async fn is_live(&self, host: &HostContext) -> Result<bool, ModuleError> {
        is_unit_active(host, self.kind(), CRON_SERVICE).await
    }

    async fn activate(&self, host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        if is_unit_active(host, self.kind(), CRON_SERVICE).await? {
            return Ok(());
        }
        host.exec(self.kind(), "systemctl", &["start", CRON_SERVICE]).await?;
        Ok(())
    }

    async fn verify(&self, host: &HostContext) -> Result<(), ModuleError> {
        if is_unit_active(host, self.kind(), CRON_SERVICE).await? {
            Ok(())
        } else {
            Err(ModuleError::new(
                self.kind(),
                Failure::Verification("cron service is not active".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use crate::test_utils::{mock_host, mutating_calls};
    use crate::{reconcile_module, Change};
    use noco_nodeconfig::{Crontab, ObjectKey};
    use std::fs;
    use tempfile::TempDir;

    fn entry(name: &str, special: Option<&str>) -> Crontab {
        Crontab {
            name: name.into(),
            special_time: special.map(str::to_string),
            minute: "0".into(),
            hour: "3".into(),
            day_of_month: "*".into(),
            month: "*".into(),
            day_of_week: "*".into(),
            job: "/usr/local/bin/backup.sh".into(),
            user: "root".into(),
        }
    }

    fn module(entries: Vec<Crontab>, state: ModuleState) -> CrontabsModule {
        CrontabsModule::new(
            Crontabs { entries, state, priority: None },
            ArtifactOwner::new(&ObjectKey::new("ops", "jobs-a"), 50),
        )
    }

    #[tokio::test]
    async fn test_writes_one_file_per_entry() {
        let temp = TempDir::new().unwrap();
        let (host, runner) = mock_host(temp.path());
        let m = module(
            vec![entry("Nightly Backup", None), entry("warm cache", Some("reboot"))],
            ModuleState::Present,
        );

        assert_eq!(reconcile_module(&m, &host).await.unwrap(), Change::Applied);

        let dir = temp.path().join("etc/cron.d");
        assert_eq!(
            fs::read_to_string(dir.join("nco_ops_jobs_a_nightly_backup")).unwrap(),
            "0 3 * * * root /usr/local/bin/backup.sh # Nightly Backup\n"
        );
        assert_eq!(
            fs::read_to_string(dir.join("nco_ops_jobs_a_warm_cache")).unwrap(),
            "@reboot root /usr/local/bin/backup.sh # warm cache\n"
        );
        assert!(mutating_calls(&runner).is_empty());

        assert_eq!(reconcile_module(&m, &host).await.unwrap(), Change::Unchanged);
    }

    #[tokio::test]
    async fn test_starts_cron_when_inactive() {
        let temp = TempDir::new().unwrap();
        let (host, runner) = mock_host(temp.path());
        runner.respond("systemctl is-active", CommandOutput::failed(3, ""));

        let err = reconcile_module(&module(vec![entry("backup", None)], ModuleState::Present), &host)
            .await
            .unwrap_err();
        assert_eq!(mutating_calls(&runner), vec!["systemctl start cron"]);
        assert_eq!(err.to_string(), "crontabs: cron service is not active");
    }

    #[tokio::test]
    async fn test_legacy_file_is_migrated() {
        let temp = TempDir::new().unwrap();
        let (host, _) = mock_host(temp.path());
        let legacy = temp.path().join("etc/cron.d/backup");
        fs::create_dir_all(legacy.parent().unwrap()).unwrap();
        fs::write(&legacy, "0 3 * * * root /bin/true # backup").unwrap();

        reconcile_module(&module(vec![entry("backup", None)], ModuleState::Present), &host)
            .await
            .unwrap();
        assert!(!legacy.exists());
        assert!(temp.path().join("etc/cron.d/nco_ops_jobs_a_backup").exists());
    }

    #[tokio::test]
    async fn test_absent_removes_files() {
        let temp = TempDir::new().unwrap();
        let (host, _) = mock_host(temp.path());
        let entries = vec![entry("backup", None)];
        reconcile_module(&module(entries.clone(), ModuleState::Present), &host)
            .await
            .unwrap();

        assert_eq!(
            reconcile_module(&module(entries, ModuleState::Absent), &host).await.unwrap(),
            Change::Removed
        );
        assert!(!temp.path().join("etc/cron.d/nco_ops_jobs_a_backup").exists());
    }
}
