// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot of what currently exists at a path.

use crate::{
    entry::{
        lazy::{LazyContents, LazyLinkname},
        EntryError, Result,
    },
    system::{mode_of, perm_of, System},
};

use std::path::{Path, PathBuf};

/// What currently exists at a path.
///
/// File contents and link targets are read on first request through the
/// system the entry was built with, and cached for the lifetime of the entry.
#[derive(Debug)]
pub enum ActualStateEntry<'a> {
    /// Nothing exists.
    Absent { path: PathBuf },

    /// Directory exists.
    Dir { path: PathBuf, perm: u32 },

    /// Regular file exists.
    File {
        path: PathBuf,
        perm: u32,
        contents: LazyContents<'a>,
    },

    /// Symbolic link exists.
    Symlink {
        path: PathBuf,
        linkname: LazyLinkname<'a>,
    },
}

impl<'a> ActualStateEntry<'a> {
    /// Inspect `path` through `system`.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::UnsupportedFileType`] if `path` is a device,
    ///   socket, pipe, or anything else that cannot be managed.
    /// - Return [`EntryError::System`] if `path` cannot be inspected for any
    ///   reason other than not existing.
    pub fn new<S>(system: &'a S, path: impl Into<PathBuf>) -> Result<Self>
    where
        S: System + ?Sized,
    {
        let path = path.into();
        let metadata = match system.lstat(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.is_not_found() => return Ok(Self::Absent { path }),
            Err(err) => return Err(err.into()),
        };

        let file_type = metadata.file_type();
        let entry = if file_type.is_file() {
            let source = path.clone();
            Self::File {
                path,
                perm: perm_of(&metadata),
                contents: LazyContents::deferred(move || system.read_file(&source)),
            }
        } else if file_type.is_dir() {
            Self::Dir {
                path,
                perm: perm_of(&metadata),
            }
        } else if file_type.is_symlink() {
            let source = path.clone();
            Self::Symlink {
                path,
                linkname: LazyLinkname::deferred(move || system.readlink(&source)),
            }
        } else {
            return Err(EntryError::UnsupportedFileType {
                path,
                mode: mode_of(&metadata),
            });
        };

        Ok(entry)
    }

    /// Path this entry describes.
    pub fn path(&self) -> &Path {
        match self {
            Self::Absent { path }
            | Self::Dir { path, .. }
            | Self::File { path, .. }
            | Self::Symlink { path, .. } => path,
        }
    }

    /// Check if nothing exists.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent { .. })
    }

    /// Remove whatever exists at the path.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::System`] if removal fails.
    pub fn remove<S>(&self, system: &S) -> Result<()>
    where
        S: System + ?Sized,
    {
        match self {
            Self::Absent { .. } => Ok(()),
            _ => Ok(system.remove_all(self.path())?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::memory::MemoryPersistentState, system::real::RealSystem};
    use pretty_assertions::assert_eq;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn classify_existing_paths() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = RealSystem::new(MemoryPersistentState::new());
        system.write_file(&dir.path().join("file"), b"contents", 0o600)?;
        system.mkdir(&dir.path().join("dir"), 0o750)?;
        system.create_symlink(&dir.path().join("link"), Path::new("file"))?;

        let entry = ActualStateEntry::new(&system, dir.path().join("missing"))?;
        assert!(entry.is_absent());

        match ActualStateEntry::new(&system, dir.path().join("file"))? {
            ActualStateEntry::File { perm, contents, .. } => {
                assert_eq!(perm, 0o600);
                assert_eq!(contents.contents()?, b"contents");
            }
            entry => panic!("expected file, got {entry:?}"),
        }

        match ActualStateEntry::new(&system, dir.path().join("dir"))? {
            ActualStateEntry::Dir { perm, .. } => assert_eq!(perm, 0o750),
            entry => panic!("expected directory, got {entry:?}"),
        }

        match ActualStateEntry::new(&system, dir.path().join("link"))? {
            ActualStateEntry::Symlink { linkname, .. } => {
                assert_eq!(linkname.linkname()?, Path::new("file"))
            }
            entry => panic!("expected symlink, got {entry:?}"),
        }

        Ok(())
    }

    #[test]
    fn reject_named_pipe() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("fifo");
        let status = Command::new("mkfifo").arg(&path).status()?;
        assert!(status.success());

        let system = RealSystem::new(MemoryPersistentState::new());
        let result = ActualStateEntry::new(&system, &path);
        assert!(matches!(result, Err(EntryError::UnsupportedFileType { .. })));

        Ok(())
    }

    #[test]
    fn remove_entries() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = RealSystem::new(MemoryPersistentState::new());
        let path = dir.path().join("dir");
        system.mkdir(&path.join("nested"), 0o755)?;

        ActualStateEntry::new(&system, &path)?.remove(&system)?;
        assert!(ActualStateEntry::new(&system, &path)?.is_absent());

        ActualStateEntry::new(&system, &path)?.remove(&system)?;

        Ok(())
    }
}
