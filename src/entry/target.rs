// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! What should exist at a path, and how to get there.
//!
//! # Permissions
//!
//! Permission bits are always compared and created through a umask. Bits
//! cleared by the umask are never compared, so a target permission of `0o666`
//! under umask `0o022` is satisfied by `0o644` but not by `0o600`.
//!
//! # Scripts
//!
//! Scripts run at most once per unique body. The SHA-256 of the body is kept
//! in the script once bucket after a successful run. Failed scripts are not
//! recorded, so they are tried again on the next apply.

use crate::{
    entry::{
        actual::ActualStateEntry,
        lazy::{sha256_sum, LazyContents, LazyLinkname},
        record::{EntryState, MODE_DIR, MODE_SYMLINK},
        EntryError, Result,
    },
    store::SCRIPT_ONCE_STATE_BUCKET,
    system::System,
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Component, Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// What should exist at a path.
#[derive(Debug)]
pub enum TargetStateEntry {
    /// Nothing should exist.
    Absent,

    /// Directory should exist with permission bits `perm`.
    Dir { perm: u32 },

    /// Regular file should exist with exact contents and permission bits.
    File {
        perm: u32,
        contents: LazyContents<'static>,
    },

    /// Regular file should exist with permission bits `perm`, whatever its
    /// contents.
    Present { perm: u32 },

    /// Symbolic link should exist pointing at `linkname`.
    Symlink { linkname: LazyLinkname<'static> },

    /// Script named `name` should have run once with `contents`.
    Script {
        name: String,
        contents: LazyContents<'static>,
    },

    /// Directory should be renamed to `new_name` inside the same parent.
    RenameDir { new_name: String },
}

impl TargetStateEntry {
    /// Bring `actual` in line with this target through `system`.
    ///
    /// Returns whether anything had to be done.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::System`] if any system operation fails,
    ///   including a script that exits unsuccessfully.
    /// - Return [`EntryError::PersistentState`] if the script once marker
    ///   cannot be read or written.
    pub fn apply<S>(&self, system: &S, actual: &ActualStateEntry<'_>, umask: u32) -> Result<bool>
    where
        S: System + ?Sized,
    {
        let path = actual.path();
        match self {
            Self::Absent => {
                if actual.is_absent() {
                    return Ok(false);
                }
                actual.remove(system)?;
            }
            Self::Dir { perm } => {
                if let ActualStateEntry::Dir { perm: actual_perm, .. } = actual {
                    if umask_perm_equal(*actual_perm, *perm, umask) {
                        return Ok(false);
                    }
                    system.chmod(path, perm & !umask)?;
                } else {
                    actual.remove(system)?;
                    system.mkdir(path, perm & !umask)?;
                }
            }
            Self::File { perm, contents } => {
                if let ActualStateEntry::File {
                    perm: actual_perm,
                    contents: actual_contents,
                    ..
                } = actual
                {
                    if actual_contents.contents_sha256()? != contents.contents_sha256()? {
                        system.write_file(path, contents.contents()?, perm & !umask)?;
                    } else if !umask_perm_equal(*actual_perm, *perm, umask) {
                        system.chmod(path, perm & !umask)?;
                    } else {
                        return Ok(false);
                    }
                } else {
                    actual.remove(system)?;
                    system.write_file(path, contents.contents()?, perm & !umask)?;
                }
            }
            Self::Present { perm } => {
                if let ActualStateEntry::File {
                    perm: actual_perm, ..
                } = actual
                {
                    if umask_perm_equal(*actual_perm, *perm, umask) {
                        return Ok(false);
                    }
                    system.chmod(path, perm & !umask)?;
                } else {
                    actual.remove(system)?;
                    system.write_file(path, b"", perm & !umask)?;
                }
            }
            Self::Symlink { linkname } => {
                if let ActualStateEntry::Symlink {
                    linkname: actual_linkname,
                    ..
                } = actual
                {
                    if actual_linkname.linkname()? == linkname.linkname()? {
                        return Ok(false);
                    }
                }
                actual.remove(system)?;
                system.create_symlink(path, linkname.linkname()?)?;
            }
            Self::Script { name, contents } => return run_script_once(system, path, name, contents),
            Self::RenameDir { new_name } => {
                if actual.is_absent() {
                    return Ok(false);
                }
                // INVARIANT: Renames never leave the parent directory.
                if !is_file_name(new_name) {
                    return Err(EntryError::InvalidNewName {
                        path: path.to_path_buf(),
                        new_name: new_name.clone(),
                    });
                }
                let new_path = path.parent().unwrap_or_else(|| Path::new("")).join(new_name);
                system.rename(path, &new_path)?;
            }
        }

        Ok(true)
    }

    /// Check if `actual` already satisfies this target.
    ///
    /// Scripts never compare equal, whether they should run is decided by
    /// their once marker instead.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::System`] if contents or link targets needed for
    ///   the comparison cannot be read.
    pub fn equal(&self, actual: &ActualStateEntry<'_>, umask: u32) -> Result<bool> {
        let equal = match (self, actual) {
            (Self::Absent, ActualStateEntry::Absent { .. }) => true,
            (Self::Dir { perm }, ActualStateEntry::Dir { perm: actual_perm, .. }) => {
                umask_perm_equal(*actual_perm, *perm, umask)
            }
            (
                Self::File { perm, contents },
                ActualStateEntry::File {
                    perm: actual_perm,
                    contents: actual_contents,
                    ..
                },
            ) => {
                actual_contents.contents_sha256()? == contents.contents_sha256()?
                    && umask_perm_equal(*actual_perm, *perm, umask)
            }
            (Self::Present { perm }, ActualStateEntry::File { perm: actual_perm, .. }) => {
                umask_perm_equal(*actual_perm, *perm, umask)
            }
            (
                Self::Symlink { linkname },
                ActualStateEntry::Symlink {
                    linkname: actual_linkname,
                    ..
                },
            ) => actual_linkname.linkname()? == linkname.linkname()?,
            (Self::RenameDir { .. }, ActualStateEntry::Absent { .. }) => true,
            _ => false,
        };

        Ok(equal)
    }

    /// Compute fingerprint to persist after a successful apply.
    ///
    /// Only entries that leave something behind have a fingerprint, so
    /// absent targets, renames, and scripts produce none.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::System`] if contents or link target cannot be
    ///   read.
    pub fn entry_state(&self, umask: u32) -> Result<Option<EntryState>> {
        let state = match self {
            Self::Dir { perm } => EntryState {
                mode: MODE_DIR | (perm & !umask),
                contents_sha256: Vec::new(),
            },
            Self::File { perm, contents } => EntryState {
                mode: perm & !umask,
                contents_sha256: contents.contents_sha256()?.to_vec(),
            },
            Self::Present { perm } => EntryState {
                mode: perm & !umask,
                contents_sha256: Vec::new(),
            },
            Self::Symlink { linkname } => EntryState {
                mode: MODE_SYMLINK,
                contents_sha256: sha256_sum(linkname.linkname()?.to_string_lossy().as_bytes()),
            },
            Self::Absent | Self::Script { .. } | Self::RenameDir { .. } => return Ok(None),
        };

        Ok(Some(state))
    }

    /// Check if this target is a script.
    pub fn is_script(&self) -> bool {
        matches!(self, Self::Script { .. })
    }

    /// Check if this script target still has to run.
    ///
    /// Always false for targets that are not scripts.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::PersistentState`] if the once marker cannot be
    ///   read.
    pub fn script_pending<S>(&self, system: &S) -> Result<bool>
    where
        S: System + ?Sized,
    {
        let Self::Script { contents, .. } = self else {
            return Ok(false);
        };
        if is_blank(contents.contents()?) {
            return Ok(false);
        }

        let key = contents.contents_sha256()?;
        Ok(system.persistent_state().get(SCRIPT_ONCE_STATE_BUCKET, key)?.is_none())
    }

    /// Forget that this script ran, so the next apply runs it again.
    ///
    /// Does nothing for targets that are not scripts.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::PersistentState`] if the once marker cannot be
    ///   deleted.
    pub fn forget_script<S>(&self, system: &S) -> Result<()>
    where
        S: System + ?Sized,
    {
        if let Self::Script { contents, .. } = self {
            let key = contents.contents_sha256()?;
            system.persistent_state().delete(SCRIPT_ONCE_STATE_BUCKET, key)?;
        }

        Ok(())
    }
}

fn run_script_once<S>(system: &S, path: &Path, name: &str, contents: &LazyContents<'_>) -> Result<bool>
where
    S: System + ?Sized,
{
    let data = contents.contents()?;
    if is_blank(data) {
        debug!("skip empty script {name:?}");
        return Ok(false);
    }

    let state = system.persistent_state();
    let key = contents.contents_sha256()?;
    if state.get(SCRIPT_ONCE_STATE_BUCKET, key)?.is_some() {
        debug!("skip script {name:?} that already ran");
        return Ok(false);
    }

    let dir = working_dir(system, path);
    system.run_script(name, &dir, data)?;

    // INVARIANT: Marker is only written after the script succeeds.
    let marker = serde_json::to_vec(&serde_json::json!({ "name": name }))?;
    state.set(SCRIPT_ONCE_STATE_BUCKET, key, &marker)?;

    Ok(true)
}

/// Deepest existing directory above `path`, where scripts run.
fn working_dir<S>(system: &S, path: &Path) -> PathBuf
where
    S: System + ?Sized,
{
    path.ancestors()
        .skip(1)
        .find(|dir| system.stat(dir).is_ok_and(|metadata| metadata.is_dir()))
        .unwrap_or_else(|| Path::new("/"))
        .to_path_buf()
}

fn is_blank(data: &[u8]) -> bool {
    data.iter().all(u8::is_ascii_whitespace)
}

/// Check if `name` is exactly one plain file name, e.g., no separators, no
/// `..`, and not absolute.
pub fn is_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Compare permission bits `actual` and `target`, ignoring bits in `umask`.
#[cfg(unix)]
pub fn umask_perm_equal(actual: u32, target: u32, umask: u32) -> bool {
    actual & !umask & 0o777 == target & !umask & 0o777
}

/// Compare permission bits `actual` and `target`, ignoring bits in `umask`.
///
/// Permission bits are not meaningful enough on Windows to compare.
#[cfg(windows)]
pub fn umask_perm_equal(_actual: u32, _target: u32, _umask: u32) -> bool {
    true
}

/// Get umask of current process.
///
/// The mask is briefly cleared to read it, so files created by other threads
/// in the meantime are not masked. Call this once, before spawning threads.
#[cfg(unix)]
pub fn process_umask() -> u32 {
    // SAFETY: umask cannot fail. The original mask is restored right away.
    let umask = unsafe {
        let umask = libc::umask(0);
        libc::umask(umask);
        umask
    };

    u32::from(umask)
}

/// Get umask of current process.
#[cfg(windows)]
pub fn process_umask() -> u32 {
    0
}

/// Selection of entry types to operate on.
///
/// Written as a comma separated list of `absent`, `dirs`, `files`, `scripts`,
/// `symlinks`, or just `all`. Present targets count as files, and directory
/// renames count as directories.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct IncludeSet {
    bits: u8,
}

impl IncludeSet {
    pub const ABSENT: Self = Self { bits: 1 };
    pub const DIRS: Self = Self { bits: 1 << 1 };
    pub const FILES: Self = Self { bits: 1 << 2 };
    pub const SCRIPTS: Self = Self { bits: 1 << 3 };
    pub const SYMLINKS: Self = Self { bits: 1 << 4 };
    pub const ALL: Self = Self { bits: 0b1_1111 };
    pub const NONE: Self = Self { bits: 0 };

    const NAMES: [(&'static str, Self); 5] = [
        ("absent", Self::ABSENT),
        ("dirs", Self::DIRS),
        ("files", Self::FILES),
        ("scripts", Self::SCRIPTS),
        ("symlinks", Self::SYMLINKS),
    ];

    /// Combine with `other`.
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    /// Check if every type in `other` is selected.
    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Check if `target` is selected.
    pub fn includes(self, target: &TargetStateEntry) -> bool {
        let kind = match target {
            TargetStateEntry::Absent => Self::ABSENT,
            TargetStateEntry::Dir { .. } | TargetStateEntry::RenameDir { .. } => Self::DIRS,
            TargetStateEntry::File { .. } | TargetStateEntry::Present { .. } => Self::FILES,
            TargetStateEntry::Script { .. } => Self::SCRIPTS,
            TargetStateEntry::Symlink { .. } => Self::SYMLINKS,
        };

        self.contains(kind)
    }
}

impl Default for IncludeSet {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromStr for IncludeSet {
    type Err = EntryError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut set = Self::NONE;
        for name in data.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if name == "all" {
                set = set.union(Self::ALL);
                continue;
            }

            let (_, kind) = Self::NAMES
                .iter()
                .find(|(known, _)| *known == name)
                .ok_or_else(|| EntryError::InvalidInclude {
                    value: name.to_string(),
                })?;
            set = set.union(*kind);
        }

        Ok(set)
    }
}

impl Display for IncludeSet {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if *self == Self::ALL {
            return fmt.write_str("all");
        }

        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, kind)| self.contains(*kind))
            .map(|(name, _)| *name)
            .collect();
        fmt.write_str(&names.join(","))
    }
}

impl TryFrom<String> for IncludeSet {
    type Error = EntryError;

    fn try_from(data: String) -> Result<Self, Self::Error> {
        data.parse()
    }
}

impl From<IncludeSet> for String {
    fn from(set: IncludeSet) -> Self {
        set.to_string()
    }
}
