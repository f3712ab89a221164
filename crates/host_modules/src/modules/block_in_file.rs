use async_trait::async_trait;
use std::path::PathBuf;

use noco_nodeconfig::{BlockInFiles, ModuleKind, ModuleSection, ModuleState};

use crate::{Artifact, HostContext, Module, ModuleError};

/// Marker blocks inside arbitrary host files. The markers come from the
/// declaration, so they are the block's identity.
pub struct BlockInFileModule {
    section: BlockInFiles,
}

impl BlockInFileModule {
    pub fn new(section: BlockInFiles) -> Self {
        Self { section }
    }

    fn artifacts(&self, host: &HostContext) -> Vec<Artifact> {
        self.section
            .blocks
            .iter()
            .map(|b| Artifact::block(host.path(&b.filename), &b.begin_marker, &b.end_marker, b.content.as_str()))
            .collect()
    }
}

#[async_trait]
impl Module for BlockInFileModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::BlockInFiles
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

    async fn activate(&self, _host: &HostContext, _changed: &[PathBuf]) -> Result<(), ModuleError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_host;
    use crate::{reconcile_module, Change};
    use noco_nodeconfig::BlockInFile;
    use std::fs;
    use tempfile::TempDir;

    fn section(state: ModuleState) -> BlockInFiles {
        BlockInFiles {
            blocks: vec![BlockInFile {
                filename: "/etc/motd".into(),
                content: "managed line\n".into(),
                begin_marker: "# BEGIN X".into(),
                end_marker: "# END X".into(),
            }],
            state,
            priority: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_remove_block() {
        let temp = TempDir::new().unwrap();
        let (host, runner) = mock_host(temp.path());
        let motd = temp.path().join("etc/motd");
        fs::create_dir_all(motd.parent().unwrap()).unwrap();
        fs::write(&motd, "welcome\n").unwrap();

        let present = BlockInFileModule::new(section(ModuleState::Present));
        assert_eq!(reconcile_module(&present, &host).await.unwrap(), Change::Applied);
        assert_eq!(
            fs::read_to_string(&motd).unwrap(),
            "welcome\n# BEGIN X\nmanaged line\n# END X\n"
        );
        assert_eq!(reconcile_module(&present, &host).await.unwrap(), Change::Unchanged);

        let absent = BlockInFileModule::new(section(ModuleState::Absent));
        assert_eq!(reconcile_module(&absent, &host).await.unwrap(), Change::Removed);
        assert_eq!(fs::read_to_string(&motd).unwrap(), "welcome\n");
        assert!(runner.calls().is_empty());
    }
}
