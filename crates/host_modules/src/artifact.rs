//! Things a module owns on the host filesystem.

use std::io;
use std::path::{Path, PathBuf};

use crate::fsutil::{read_optional, remove_if_exists, write_atomic};
use crate::marker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// A whole file owned by one module and one object.
    File { path: PathBuf, content: String },
    /// A marker-delimited block inside a file that others also edit.
    Block {
        path: PathBuf,
        begin: String,
        end: String,
        content: String,
    },
}

impl Artifact {
    pub fn file(path: PathBuf, content: impl Into<String>) -> Self {
        Artifact::File {
            path,
            content: content.into(),
        }
    }

    /// A file that is only ever removed, never written.
    pub fn stale(path: PathBuf) -> Self {
        Artifact::file(path, String::new())
    }

    pub fn block(path: PathBuf, begin: &str, end: &str, content: impl Into<String>) -> Self {
        Artifact::Block {
            path,
            begin: begin.to_string(),
            end: end.to_string(),
            content: content.into(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Artifact::File { path, .. } | Artifact::Block { path, .. } => path,
        }
    }

    /// Full new file content if the host differs from the desired state,
    /// `None` when nothing needs to be written.
    pub fn pending(&self) -> io::Result<Option<String>> {
        match self {
            Artifact::File { path, content } => match read_optional(path)? {
                Some(current) if &current == content => Ok(None),
                _ => Ok(Some(content.clone())),
            },
            Artifact::Block {
                path,
                begin,
                end,
                content,
            } => {
                let current = read_optional(path)?;
                let base = current.as_deref().unwrap_or("");
                let next = marker::insert_block(base, begin, end, content);
                if current.as_deref() == Some(next.as_str()) {
                    Ok(None)
                } else {
                    Ok(Some(next))
                }
            }
        }
    }

    pub fn write(&self, content: &str) -> io::Result<()> {
        write_atomic(self.path(), content)
    }

    /// Returns true if something was removed.
    pub fn remove(&self) -> io::Result<bool> {
        match self {
            Artifact::File { path, .. } => remove_if_exists(path),
            Artifact::Block { path, begin, end, .. } => {
                let Some(current) = read_optional(path)? else {
                    return Ok(false);
                };
                let next = marker::delete_block(&current, begin, end);
                if next == current {
                    return Ok(false);
                }
                write_atomic(path, &next)?;
                Ok(true)
            }
        }
    }
}
