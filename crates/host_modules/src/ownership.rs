//! Artifact naming scoped to the owning object and a priority.
//!
//! Two objects never produce the same artifact name: the owner slug is
//! part of every name and the priority prefix only decides load order.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use noco_nodeconfig::ObjectKey;

/// Identity of the object an artifact belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOwner {
    pub namespace: String,
    pub name: String,
    pub priority: u8,
}

impl ArtifactOwner {
    pub fn new(key: &ObjectKey, priority: u8) -> Self {
        Self {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            priority,
        }
    }

    pub fn with_priority(&self, priority: u8) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }

    /// `<namespace>_<name>`. Object names never contain `_`, so the
    /// slug is unambiguous.
    pub fn slug(&self) -> String {
        format!("{}_{}", slug_part(&self.namespace), slug_part(&self.name))
    }

    /// Slug restricted to `[a-z0-9_]` for directories such as cron.d
    /// that skip files with other characters.
    pub fn cron_slug(&self) -> String {
        cron_file_name(&self.slug().replace(['-', '.'], "_"))
    }

    /// `<priority>-nco-<slug>`. The priority is zero padded so lexical
    /// order (as used by sysctl.d, modules-load.d, grub.d) is numeric order.
    pub fn file_stem(&self) -> String {
        format!("{:02}-nco-{}", self.priority, self.slug())
    }

    /// This owner's files in `dir` that carry a different priority, i.e.
    /// leftovers from before a priority change.
    pub fn other_priority_files(&self, dir: &Path, suffix: &str) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let tail = format!("-nco-{}{}", self.slug(), suffix);
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(prefix) = file_name.strip_suffix(tail.as_str()) else {
                continue;
            };
            let is_priority = prefix.len() == 2 && prefix.bytes().all(|b| b.is_ascii_digit());
            if is_priority && prefix != format!("{:02}", self.priority) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}

fn slug_part(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}

/// Cron-safe file name: lower case, spaces to underscores, only
/// `[a-z0-9_]` kept. cron ignores files in cron.d with other characters.
pub fn cron_file_name(name: &str) -> String {
    name.to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn owner(ns: &str, name: &str, priority: u8) -> ArtifactOwner {
        ArtifactOwner::new(&ObjectKey::new(ns, name), priority)
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(owner("infra", "sysctl", 50).file_stem(), "50-nco-infra_sysctl");
        assert_eq!(owner("infra", "sysctl", 5).file_stem(), "05-nco-infra_sysctl");
        assert_eq!(owner("Infra", "a.b", 0).file_stem(), "00-nco-infra_a.b");
        assert_eq!(owner("kube-system", "a.b", 0).cron_slug(), "kube_system_a_b");
    }

    #[test]
    fn test_distinct_owners_distinct_names() {
        let a = owner("ns", "a", 50);
        let b = owner("ns", "b", 50);
        let a_low = a.with_priority(10);
        assert_ne!(a.file_stem(), b.file_stem());
        assert_ne!(a.file_stem(), a_low.file_stem());
        assert_eq!(a.slug(), a_low.slug());
    }

    #[test]
    fn test_other_priority_files() {
        let dir = TempDir::new().unwrap();
        for name in [
            "50-nco-ns_a.conf",
            "40-nco-ns_a.conf",
            "40-nco-ns_a-b.conf",
            "40-nco-ns_b.conf",
            "99-nco.conf",
            "x40-nco-ns_a.conf",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let found = owner("ns", "a", 50)
            .other_priority_files(dir.path(), ".conf")
            .unwrap();
        assert_eq!(found, vec![dir.path().join("40-nco-ns_a.conf")]);
    }

    #[test]
    fn test_other_priority_files_missing_dir() {
        let dir = TempDir::new().unwrap();
        let found = owner("ns", "a", 50)
            .other_priority_files(&dir.path().join("missing"), ".conf")
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_cron_file_name() {
        assert_eq!(cron_file_name("Clean Tmp Dir"), "clean_tmp_dir");
        assert_eq!(cron_file_name("backup-db.daily"), "backupdbdaily");
    }
}
