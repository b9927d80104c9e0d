// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System that performs every operation for real.

use crate::{
    store::PersistentState,
    system::{command_name, Interpreters, Result, System, SystemError},
};

use std::{
    fs::{self, Metadata},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process::Command,
    rc::Rc,
    thread,
    time::Duration,
};
use tempfile::NamedTempFile;
use tracing::debug;

const SPAWN_RETRIES: u32 = 50;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Direct access to the file system, processes, and persistent state.
pub struct RealSystem {
    state: Rc<dyn PersistentState>,
    interpreters: Interpreters,
}

impl RealSystem {
    /// Construct new real system backed by persistent state `state`.
    pub fn new(state: impl PersistentState + 'static) -> Self {
        Self {
            state: Rc::new(state),
            interpreters: Interpreters::default(),
        }
    }

    /// Use `interpreters` to run scripts with matching extensions.
    pub fn with_interpreters(mut self, interpreters: Interpreters) -> Self {
        self.interpreters = interpreters;
        self
    }
}

impl System for RealSystem {
    fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
        set_perm(path, perm)?;
        Ok(())
    }

    #[cfg(unix)]
    fn create_symlink(&self, path: &Path, target: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, path)?;
        Ok(())
    }

    #[cfg(windows)]
    fn create_symlink(&self, path: &Path, target: &Path) -> Result<()> {
        std::os::windows::fs::symlink_file(target, path)?;
        Ok(())
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        let command = command_name(cmd);
        let output = cmd.output().map_err(|err| SystemError::Spawn {
            source: err,
            command: command.clone(),
        })?;

        if !output.status.success() {
            return Err(SystemError::CommandFailed {
                command,
                status: output.status,
            });
        }

        Ok(output.stdout)
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::symlink_metadata(path)?)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent)?;
        }

        fs::create_dir(path)?;

        // INVARIANT: Exact permissions, independent of the process umask.
        self.chmod(path, perm)
    }

    fn persistent_state(&self) -> Rc<dyn PersistentState> {
        Rc::clone(&self.state)
    }

    fn raw_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(path)?)
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }

        Ok(())
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        fs::rename(old, new)?;
        Ok(())
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        let command = command_name(cmd);
        debug!("run {command:?}");
        let status = cmd.status().map_err(|err| SystemError::Spawn {
            source: err,
            command: command.clone(),
        })?;

        if !status.success() {
            return Err(SystemError::CommandFailed { command, status });
        }

        Ok(())
    }

    fn run_script(&self, name: &str, dir: &Path, data: &[u8]) -> Result<()> {
        let file_name = Path::new(name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        // INVARIANT: Script must be closed before it is executed.
        let mut file = tempfile::Builder::new()
            .prefix("oxistate-")
            .suffix(&format!(".{file_name}"))
            .tempfile()?;
        file.write_all(data)?;
        let script = file.into_temp_path();
        set_perm(&script, 0o700)?;

        let mut cmd = match self.interpreters.find(name) {
            Some(interpreter) => {
                let mut cmd = Command::new(&interpreter.command);
                cmd.args(&interpreter.args).arg(&*script);
                cmd
            }
            None => Command::new(&*script),
        };
        cmd.current_dir(self.raw_path(dir)?);

        let result = run_spawn_retry(self, &mut cmd);
        script.close()?;

        result
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::metadata(path)?)
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // INVARIANT: Replace by rename, so read-only files can be overwritten
        //   and readers never see a partial write.
        let mut file = NamedTempFile::new_in(parent)?;
        file.write_all(data)?;
        set_perm(file.path(), perm)?;
        file.persist(path).map_err(|err| err.error)?;

        Ok(())
    }
}

/// Run `cmd`, retrying while the freshly written script is still busy.
///
/// Another thread may fork while holding the script open for writing, which
/// makes executing it fail with `ETXTBSY` until that child execs or exits.
fn run_spawn_retry(system: &RealSystem, cmd: &mut Command) -> Result<()> {
    let mut attempts = 0;
    loop {
        match system.run_cmd(cmd) {
            Err(SystemError::Spawn { source, .. })
                if is_text_file_busy(&source) && attempts < SPAWN_RETRIES =>
            {
                attempts += 1;
                debug!("script busy, retry {attempts}");
                thread::sleep(SPAWN_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

#[cfg(unix)]
fn is_text_file_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(windows)]
fn is_text_file_busy(_err: &std::io::Error) -> bool {
    false
}

#[cfg(unix)]
fn set_perm(path: &Path, perm: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(perm))
}

#[cfg(windows)]
fn set_perm(path: &Path, perm: u32) -> std::io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(perm & 0o222 == 0);
    fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::memory::MemoryPersistentState, system::perm_of};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn write_file_sets_exact_permissions() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = RealSystem::new(MemoryPersistentState::new());
        let path = dir.path().join("file");

        system.write_file(&path, b"contents", 0o600)?;
        assert_eq!(perm_of(&system.lstat(&path)?), 0o600);

        system.write_file(&path, b"other", 0o644)?;
        assert_eq!(perm_of(&system.lstat(&path)?), 0o644);
        assert_eq!(system.read_file(&path)?, b"other");

        Ok(())
    }

    #[test]
    fn write_file_replaces_read_only_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = RealSystem::new(MemoryPersistentState::new());
        let path = dir.path().join("file");
        system.write_file(&path, b"old", 0o444)?;

        system.write_file(&path, b"new", 0o644)?;
        assert_eq!(system.read_file(&path)?, b"new");
        assert_eq!(perm_of(&system.lstat(&path)?), 0o644);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);

        Ok(())
    }

    #[test]
    fn mkdir_creates_parents() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = RealSystem::new(MemoryPersistentState::new());
        let path = dir.path().join("a").join("b");

        system.mkdir(&path, 0o700)?;
        let metadata = system.lstat(&path)?;
        assert!(metadata.is_dir());
        assert_eq!(perm_of(&metadata), 0o700);

        Ok(())
    }

    #[test]
    fn remove_all_ignores_missing_paths() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = RealSystem::new(MemoryPersistentState::new());
        system.remove_all(&dir.path().join("missing"))?;

        let nested = dir.path().join("a");
        system.mkdir(&nested.join("b"), 0o755)?;
        system.write_file(&nested.join("b").join("c"), b"", 0o644)?;
        system.remove_all(&nested)?;
        assert!(system.lstat(&nested).is_err_and(|err| err.is_not_found()));

        Ok(())
    }

    #[test]
    fn run_cmd_reports_exit_status_and_spawn_failure() {
        let system = RealSystem::new(MemoryPersistentState::new());

        let result = system.run_cmd(&mut Command::new("false"));
        assert!(matches!(result, Err(SystemError::CommandFailed { .. })));

        let result = system.run_cmd(&mut Command::new("oxistate-no-such-command"));
        assert!(matches!(result, Err(SystemError::Spawn { .. })));
    }

    #[test]
    fn idempotent_cmd_output_captures_stdout() -> anyhow::Result<()> {
        let system = RealSystem::new(MemoryPersistentState::new());
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        assert_eq!(system.idempotent_cmd_output(&mut cmd)?, b"hello\n");

        Ok(())
    }

    #[test]
    fn run_script_in_working_directory() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = RealSystem::new(MemoryPersistentState::new());

        system.run_script("touch.sh", dir.path(), b"#!/bin/sh\ntouch ran\n")?;
        assert!(dir.path().join("ran").exists());

        let result = system.run_script("fail.sh", dir.path(), b"#!/bin/sh\nexit 3\n");
        assert!(matches!(result, Err(SystemError::CommandFailed { .. })));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn run_script_while_other_threads_fork() -> anyhow::Result<()> {
        let handles = (0..8)
            .map(|_| {
                std::thread::spawn(|| -> anyhow::Result<()> {
                    let dir = TempDir::new()?;
                    let system = RealSystem::new(MemoryPersistentState::new());
                    for _ in 0..10 {
                        system.run_script("noop.sh", dir.path(), b"#!/bin/sh\nexit 0\n")?;
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().map_err(|_| anyhow::anyhow!("script thread panicked"))??;
        }

        Ok(())
    }
}
