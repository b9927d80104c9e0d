// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System that pretends to change things.

use crate::{
    store::{decorate::DryRunPersistentState, PersistentState},
    system::{Result, System},
};

use std::{
    cell::Cell,
    fs::Metadata,
    path::{Path, PathBuf},
    process::Command,
    rc::Rc,
};

/// Record every mutation without performing it.
///
/// Reads and commands pass through, so reads keep seeing the file system as
/// it was. The persistent state of the inner system is wrapped for dry runs.
pub struct DryRunSystem<S> {
    system: S,
    state: Rc<DryRunPersistentState<Rc<dyn PersistentState>>>,
    modified: Cell<bool>,
}

impl<S> DryRunSystem<S>
where
    S: System,
{
    /// Wrap `system` for dry runs.
    pub fn new(system: S) -> Self {
        let state = Rc::new(DryRunPersistentState::new(system.persistent_state()));
        Self {
            system,
            state,
            modified: Cell::new(false),
        }
    }

    /// Check if a mutation of the file system or persistent state was
    /// attempted.
    pub fn modified(&self) -> bool {
        self.modified.get() || self.state.modified()
    }

    fn record(&self) -> Result<()> {
        self.modified.set(true);
        Ok(())
    }
}

impl<S> System for DryRunSystem<S>
where
    S: System,
{
    fn chmod(&self, _path: &Path, _perm: u32) -> Result<()> {
        self.record()
    }

    fn create_symlink(&self, _path: &Path, _target: &Path) -> Result<()> {
        self.record()
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        self.system.idempotent_cmd_output(cmd)
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        self.system.lstat(path)
    }

    fn mkdir(&self, _path: &Path, _perm: u32) -> Result<()> {
        self.record()
    }

    fn persistent_state(&self) -> Rc<dyn PersistentState> {
        self.state.clone()
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

    fn remove_all(&self, _path: &Path) -> Result<()> {
        self.record()
    }

    fn rename(&self, _old: &Path, _new: &Path) -> Result<()> {
        self.record()
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        self.system.run_cmd(cmd)
    }

    fn run_script(&self, _name: &str, _dir: &Path, _data: &[u8]) -> Result<()> {
        self.record()
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        self.system.stat(path)
    }

    fn write_file(&self, _path: &Path, _data: &[u8], _perm: u32) -> Result<()> {
        self.record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::memory::MemoryPersistentState, system::real::RealSystem};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn mutations_are_recorded_not_performed() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file");
        let system = DryRunSystem::new(RealSystem::new(MemoryPersistentState::new()));
        assert!(!system.modified());

        system.write_file(&path, b"contents", 0o644)?;
        system.mkdir(&dir.path().join("dir"), 0o755)?;
        assert!(system.modified());
        assert!(system.lstat(&path).is_err_and(|err| err.is_not_found()));
        assert!(!dir.path().join("dir").exists());

        Ok(())
    }

    #[test]
    fn persistent_state_writes_count_as_modification() -> anyhow::Result<()> {
        let system = DryRunSystem::new(RealSystem::new(MemoryPersistentState::new()));
        let state = system.persistent_state();

        state.set(b"bucket", b"key", b"value")?;
        assert!(system.modified());
        assert_eq!(state.get(b"bucket", b"key")?, None);

        Ok(())
    }
}
