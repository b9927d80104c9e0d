// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System that logs every call.

use crate::{
    store::{decorate::DebugPersistentState, PersistentState},
    system::{command_name, Result, System},
};

use std::{
    fs::Metadata,
    path::{Path, PathBuf},
    process::Command,
    rc::Rc,
};
use tracing::debug;

/// Log every call at debug level, along with its outcome.
///
/// Persistent state access is logged too.
pub struct DebugSystem<S> {
    system: S,
    state: Rc<dyn PersistentState>,
}

impl<S> DebugSystem<S>
where
    S: System,
{
    /// Wrap `system` with logging.
    pub fn new(system: S) -> Self {
        let state = Rc::new(DebugPersistentState::new(system.persistent_state()));
        Self { system, state }
    }
}

impl<S> System for DebugSystem<S>
where
    S: System,
{
    fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
        let result = self.system.chmod(path, perm);
        debug!(path = %path.display(), perm = %format!("{perm:03o}"), error = ?result.as_ref().err(), "Chmod");
        result
    }

    fn create_symlink(&self, path: &Path, target: &Path) -> Result<()> {
        let result = self.system.create_symlink(path, target);
        debug!(
            path = %path.display(),
            target = %target.display(),
            error = ?result.as_ref().err(),
            "Symlink"
        );
        result
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        let command = command_name(cmd);
        let result = self.system.idempotent_cmd_output(cmd);
        debug!(command = %command, error = ?result.as_ref().err(), "IdempotentCmdOutput");
        result
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        let result = self.system.lstat(path);
        debug!(path = %path.display(), error = ?result.as_ref().err(), "Lstat");
        result
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        let result = self.system.mkdir(path, perm);
        debug!(path = %path.display(), perm = %format!("{perm:03o}"), error = ?result.as_ref().err(), "Mkdir");
        result
    }

    fn persistent_state(&self) -> Rc<dyn PersistentState> {
        Rc::clone(&self.state)
    }

    fn raw_path(&self, path: &Path) -> Result<PathBuf> {
        self.system.raw_path(path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let result = self.system.read_file(path);
        debug!(
            path = %path.display(),
            size = result.as_ref().map(Vec::len).ok(),
            error = ?result.as_ref().err(),
            "ReadFile"
        );
        result
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let result = self.system.readlink(path);
        debug!(
            path = %path.display(),
            linkname = ?result.as_ref().ok(),
            error = ?result.as_ref().err(),
            "Readlink"
        );
        result
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let result = self.system.remove_all(path);
        debug!(path = %path.display(), error = ?result.as_ref().err(), "RemoveAll");
        result
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let result = self.system.rename(old, new);
        debug!(
            old = %old.display(),
            new = %new.display(),
            error = ?result.as_ref().err(),
            "Rename"
        );
        result
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        let command = command_name(cmd);
        let result = self.system.run_cmd(cmd);
        debug!(command = %command, error = ?result.as_ref().err(), "RunCmd");
        result
    }

    fn run_script(&self, name: &str, dir: &Path, data: &[u8]) -> Result<()> {
        let result = self.system.run_script(name, dir, data);
        debug!(
            name,
            dir = %dir.display(),
            size = data.len(),
            error = ?result.as_ref().err(),
            "RunScript"
        );
        result
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        let result = self.system.stat(path);
        debug!(path = %path.display(), error = ?result.as_ref().err(), "Stat");
        result
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
        let result = self.system.write_file(path, data, perm);
        debug!(
            path = %path.display(),
            size = data.len(),
            perm = %format!("{perm:03o}"),
            error = ?result.as_ref().err(),
            "WriteFile"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::memory::MemoryPersistentState, system::real::RealSystem};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn calls_pass_through() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file");
        let system = DebugSystem::new(RealSystem::new(MemoryPersistentState::new()));

        system.write_file(&path, b"contents", 0o644)?;
        assert_eq!(system.read_file(&path)?, b"contents");

        let state = system.persistent_state();
        state.set(b"bucket", b"key", b"value")?;
        assert_eq!(state.get(b"bucket", b"key")?, Some(b"value".to_vec()));

        Ok(())
    }
}
