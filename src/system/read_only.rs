// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System that refuses to change anything.

use crate::{
    store::{decorate::ReadOnlyPersistentState, PersistentState},
    system::{permission_denied, Result, System},
};

use std::{
    fs::Metadata,
    path::{Path, PathBuf},
    process::Command,
    rc::Rc,
};

/// Fail every mutation with a permission error.
///
/// Reads and commands pass through. The persistent state of the inner system
/// is exposed read-only.
pub struct ReadOnlySystem<S> {
    system: S,
    state: Rc<dyn PersistentState>,
}

impl<S> ReadOnlySystem<S>
where
    S: System,
{
    /// Wrap `system` as read-only.
    pub fn new(system: S) -> Self {
        let state = Rc::new(ReadOnlyPersistentState::new(system.persistent_state()));
        Self { system, state }
    }
}

impl<S> System for ReadOnlySystem<S>
where
    S: System,
{
    fn chmod(&self, path: &Path, _perm: u32) -> Result<()> {
        Err(permission_denied("chmod", path))
    }

    fn create_symlink(&self, path: &Path, _target: &Path) -> Result<()> {
        Err(permission_denied("symlink", path))
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        self.system.idempotent_cmd_output(cmd)
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        self.system.lstat(path)
    }

    fn mkdir(&self, path: &Path, _perm: u32) -> Result<()> {
        Err(permission_denied("mkdir", path))
    }

    fn persistent_state(&self) -> Rc<dyn PersistentState> {
        Rc::clone(&self.state)
    }

    fn raw_path(&self, path: &Path) -> Result<PathBuf> {
        self.system.raw_path(path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.system.read_file(path)
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        self.system.readlink(path)
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        Err(permission_denied("remove", path))
    }

    fn rename(&self, old: &Path, _new: &Path) -> Result<()> {
        Err(permission_denied("rename", old))
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        self.system.run_cmd(cmd)
    }

    fn run_script(&self, name: &str, _dir: &Path, _data: &[u8]) -> Result<()> {
        Err(permission_denied("run script", Path::new(name)))
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        self.system.stat(path)
    }

    fn write_file(&self, path: &Path, _data: &[u8], _perm: u32) -> Result<()> {
        Err(permission_denied("write", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::{memory::MemoryPersistentState, StoreError},
        system::real::RealSystem,
    };
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn mutations_fail_with_permission_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file");
        let real = RealSystem::new(MemoryPersistentState::new());
        real.write_file(&path, b"contents", 0o644)?;

        let system = ReadOnlySystem::new(real);
        assert!(system.write_file(&path, b"other", 0o644).is_err_and(|err| err.is_permission_denied()));
        assert!(system.remove_all(&path).is_err_and(|err| err.is_permission_denied()));
        assert!(system.chmod(&path, 0o600).is_err_and(|err| err.is_permission_denied()));
        assert!(system.mkdir(&dir.path().join("dir"), 0o755).is_err_and(|err| err.is_permission_denied()));

        assert_eq!(system.read_file(&path)?, b"contents");

        Ok(())
    }

    #[test]
    fn persistent_state_is_read_only() -> anyhow::Result<()> {
        let inner = MemoryPersistentState::new();
        inner.set(b"bucket", b"key", b"value")?;
        let system = ReadOnlySystem::new(RealSystem::new(inner));

        let state = system.persistent_state();
        assert!(matches!(
            state.set(b"bucket", b"key", b"other"),
            Err(StoreError::PermissionDenied)
        ));
        assert!(matches!(
            state.delete(b"bucket", b"key"),
            Err(StoreError::PermissionDenied)
        ));
        assert_eq!(state.get(b"bucket", b"key")?, Some(b"value".to_vec()));

        Ok(())
    }
}
