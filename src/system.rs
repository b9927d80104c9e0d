// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System capability abstraction.
//!
//! Oxistate never touches the file system, spawns a process, or writes its
//! persistent state directly. Every one of those effects goes through a
//! [`System`]. This makes it possible to change what an operation _does_
//! without changing the code that asks for it.
//!
//! # Decorators
//!
//! A [`RealSystem`] performs every operation for real. The remaining systems
//! are decorators that each own one inner system, and forward or intercept
//! calls to it:
//!
//! | Decorator            | Mutations                 | Reads and commands |
//! |----------------------|---------------------------|--------------------|
//! | [`ReadOnlySystem`]   | fail with permission error | pass through      |
//! | [`DryRunSystem`]     | recorded, never performed | pass through       |
//! | [`GitDiffSystem`]    | rendered as a git diff    | pass through       |
//! | [`DebugSystem`]      | logged                    | logged             |
//!
//! Mutation blocking decorators sit closest to the real system, while diff and
//! logging decorators sit outermost, e.g.,
//! `DebugSystem<GitDiffSystem<DryRunSystem<RealSystem>>>`. That way a diff
//! describes an intended change without it ever happening, and the log sees
//! everything that was asked for.
//!
//! [`RealSystem`]: crate::system::real::RealSystem
//! [`ReadOnlySystem`]: crate::system::read_only::ReadOnlySystem
//! [`DryRunSystem`]: crate::system::dry_run::DryRunSystem
//! [`GitDiffSystem`]: crate::system::git_diff::GitDiffSystem
//! [`DebugSystem`]: crate::system::debug::DebugSystem

pub mod debug;
pub mod dry_run;
pub mod git_diff;
pub mod read_only;
pub mod real;

use crate::store::{PersistentState, StoreError};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::Metadata,
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    rc::Rc,
};

/// Capability set for file system, process, and persistent state access.
pub trait System {
    /// Change permission bits of `path`.
    fn chmod(&self, path: &Path, perm: u32) -> Result<()>;

    /// Create symbolic link at `path` pointing to `target`.
    fn create_symlink(&self, path: &Path, target: &Path) -> Result<()>;

    /// Run `cmd` and capture its standard output.
    ///
    /// Only meant for commands that can be run repeatedly with identical
    /// effect, e.g., status queries, so decorators let it through.
    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>>;

    /// Get metadata of `path` without following symbolic links.
    fn lstat(&self, path: &Path) -> Result<Metadata>;

    /// Create directory at `path`, and any missing parents.
    fn mkdir(&self, path: &Path, perm: u32) -> Result<()>;

    /// Get handle to persistent state.
    fn persistent_state(&self) -> Rc<dyn PersistentState>;

    /// Resolve `path` to the form the underlying system needs.
    fn raw_path(&self, path: &Path) -> Result<PathBuf>;

    /// Read contents of file at `path`.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Read target of symbolic link at `path`.
    fn readlink(&self, path: &Path) -> Result<PathBuf>;

    /// Remove `path` recursively. Missing paths are ignored.
    fn remove_all(&self, path: &Path) -> Result<()>;

    /// Rename `old` to `new`.
    fn rename(&self, old: &Path, new: &Path) -> Result<()>;

    /// Run `cmd` to completion.
    fn run_cmd(&self, cmd: &mut Command) -> Result<()>;

    /// Run script `name` with contents `data` inside working directory `dir`.
    fn run_script(&self, name: &str, dir: &Path, data: &[u8]) -> Result<()>;

    /// Get metadata of `path`, following symbolic links.
    fn stat(&self, path: &Path) -> Result<Metadata>;

    /// Write `data` to file at `path` with permission bits `perm`.
    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()>;
}

macro_rules! forward_system {
    ($ty:ty) => {
        impl<S> System for $ty
        where
            S: System + ?Sized,
        {
            fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
                (**self).chmod(path, perm)
            }

            fn create_symlink(&self, path: &Path, target: &Path) -> Result<()> {
                (**self).create_symlink(path, target)
            }

            fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
                (**self).idempotent_cmd_output(cmd)
            }

            fn lstat(&self, path: &Path) -> Result<Metadata> {
                (**self).lstat(path)
            }

            fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
                (**self).mkdir(path, perm)
            }

            fn persistent_state(&self) -> Rc<dyn PersistentState> {
                (**self).persistent_state()
            }

            fn raw_path(&self, path: &Path) -> Result<PathBuf> {
                (**self).raw_path(path)
            }

            fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
                (**self).read_file(path)
            }

            fn readlink(&self, path: &Path) -> Result<PathBuf> {
                (**self).readlink(path)
            }

            fn remove_all(&self, path: &Path) -> Result<()> {
                (**self).remove_all(path)
            }

            fn rename(&self, old: &Path, new: &Path) -> Result<()> {
                (**self).rename(old, new)
            }

            fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
                (**self).run_cmd(cmd)
            }

            fn run_script(&self, name: &str, dir: &Path, data: &[u8]) -> Result<()> {
                (**self).run_script(name, dir, data)
            }

            fn stat(&self, path: &Path) -> Result<Metadata> {
                (**self).stat(path)
            }

            fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
                (**self).write_file(path, data, perm)
            }
        }
    };
}

forward_system!(Box<S>);
forward_system!(&S);

/// Script interpreter.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Interpreter {
    /// Command to run the script with.
    pub command: String,

    /// Extra arguments placed before the script path.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Interpreter {
    /// Construct new interpreter.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }
}

/// Script interpreters keyed by file extension.
///
/// # Invariant
///
/// - An extension is registered at most once.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Interpreters {
    interpreters: BTreeMap<String, Interpreter>,
}

impl Interpreters {
    /// Construct new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `interpreter` for scripts ending in `extension`.
    ///
    /// A leading dot is ignored, so "py" and ".py" name the same extension.
    ///
    /// # Errors
    ///
    /// - Return [`SystemError::DuplicateInterpreter`] if `extension` is already
    ///   registered.
    pub fn register(&mut self, extension: impl AsRef<str>, interpreter: Interpreter) -> Result<()> {
        let extension = extension.as_ref().trim_start_matches('.').to_string();
        if self.interpreters.contains_key(&extension) {
            return Err(SystemError::DuplicateInterpreter { extension });
        }
        self.interpreters.insert(extension, interpreter);

        Ok(())
    }

    /// Construct registry from listing of extension and interpreter pairs.
    ///
    /// # Errors
    ///
    /// - Return [`SystemError::DuplicateInterpreter`] if an extension shows up
    ///   more than once.
    pub fn try_from_iter(
        iter: impl IntoIterator<Item = (impl AsRef<str>, Interpreter)>,
    ) -> Result<Self> {
        let mut interpreters = Self::new();
        for (extension, interpreter) in iter {
            interpreters.register(extension, interpreter)?;
        }

        Ok(interpreters)
    }

    /// Find interpreter for script named `name`.
    pub fn find(&self, name: &str) -> Option<&Interpreter> {
        Path::new(name)
            .extension()
            .and_then(|extension| self.interpreters.get(extension.to_string_lossy().as_ref()))
    }
}

/// Permission bits of `metadata`.
#[cfg(unix)]
pub fn perm_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

/// Permission bits of `metadata`.
#[cfg(windows)]
pub fn perm_of(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

/// Full mode bits of `metadata`, used in error reports.
#[cfg(unix)]
pub fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

/// Full mode bits of `metadata`, used in error reports.
#[cfg(windows)]
pub fn mode_of(metadata: &Metadata) -> u32 {
    perm_of(metadata)
}

pub(crate) fn permission_denied(op: &str, path: &Path) -> SystemError {
    SystemError::Io(IoError::new(
        ErrorKind::PermissionDenied,
        format!("{op} {:?}: read-only system", path.display()),
    ))
}

pub(crate) fn command_name(cmd: &Command) -> String {
    let mut name = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        name.push(' ');
        name.push_str(&arg.to_string_lossy());
    }
    name
}

/// System error types.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// File system operation fails.
    #[error(transparent)]
    Io(#[from] IoError),

    /// External process cannot be started.
    #[error("failed to run {command:?}")]
    Spawn {
        #[source]
        source: IoError,
        command: String,
    },

    /// External process exits unsuccessfully.
    #[error("command {command:?} failed: {status}")]
    CommandFailed { command: String, status: ExitStatus },

    /// Persistent state access fails.
    #[error(transparent)]
    PersistentState(#[from] StoreError),

    /// Script interpreter registered more than once.
    #[error("interpreter for extension {extension:?} already registered")]
    DuplicateInterpreter { extension: String },
}

impl SystemError {
    /// Check if error means that a path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == ErrorKind::NotFound)
    }

    /// Check if error means that an operation was not allowed.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == ErrorKind::PermissionDenied,
            Self::PersistentState(StoreError::PermissionDenied) => true,
            _ => false,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SystemError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn interpreters_reject_duplicates() -> anyhow::Result<()> {
        let mut interpreters = Interpreters::new();
        interpreters.register("py", Interpreter::new("python3"))?;

        let result = interpreters.register(".py", Interpreter::new("python2"));
        assert!(matches!(
            result,
            Err(SystemError::DuplicateInterpreter { extension }) if extension == "py"
        ));
        assert_eq!(interpreters.find("setup.py"), Some(&Interpreter::new("python3")));
        assert_eq!(interpreters.find("setup.sh"), None);
        assert_eq!(interpreters.find("setup"), None);

        Ok(())
    }

    #[test]
    fn command_name_joins_arguments() {
        let mut cmd = Command::new("git");
        cmd.args(["status", "--short"]);
        assert_eq!(command_name(&cmd), "git status --short");
    }
}
