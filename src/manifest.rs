// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Manifest of target state.
//!
//! A manifest is a TOML file listing every managed target name along with the
//! target state it should have. It is the source of truth the `oxistate`
//! binary reconciles the destination against.
//!
//! # General Layout
//!
//! ```toml
//! min_version = "0.1.0"
//!
//! [[entry]]
//! name = ".config"
//! type = "dir"
//!
//! [[entry]]
//! name = ".config/app.toml"
//! type = "file"
//! perm = "600"
//! source = "files/app.toml"
//!
//! [[entry]]
//! name = ".vimrc"
//! type = "symlink"
//! linkname = ".config/nvim/init.vim"
//! ```
//!
//! Entry types are `absent`, `dir`, `file`, `present`, `symlink`, `script`,
//! and `rename-dir`. Files and scripts take either inline `contents` or a
//! `source` file relative to the manifest, which is only read when needed.
//! Permissions default to `777` for directories and `666` for files, before
//! the umask is applied.

use crate::{
    apply::{Resolver, Version},
    config::Mode,
    entry::{
        lazy::{LazyContents, LazyLinkname},
        target::{is_file_name, TargetStateEntry},
    },
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

const DEFAULT_DIR_PERM: u32 = 0o777;
const DEFAULT_FILE_PERM: u32 = 0o666;

/// Manifest layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Manifest {
    /// Minimum engine version able to apply this manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<Version>,

    /// Managed entries.
    #[serde(default, rename = "entry")]
    pub entries: Vec<ManifestEntry>,
}

impl FromStr for Manifest {
    type Err = ManifestError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(ManifestError::Deserialize)
    }
}

impl Display for Manifest {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ManifestError::Serialize)?
                .as_str(),
        )
    }
}

/// Type of a manifest entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Absent,
    Dir,
    File,
    Present,
    Symlink,
    Script,
    RenameDir,
}

/// Single managed entry of a manifest.
///
/// Which optional fields are required depends on the entry type.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ManifestEntry {
    /// Target name, relative to the destination directory.
    pub name: String,

    /// Type of target state.
    #[serde(rename = "type")]
    pub kind: EntryKind,

    /// Permission bits of directories, files, and present files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perm: Option<Mode>,

    /// Inline contents of files and scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,

    /// File holding contents of files and scripts, relative to the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Target of symbolic links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkname: Option<String>,

    /// New name of renamed directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
}

/// Resolve target state from a [`Manifest`].
///
/// # Invariants
///
/// - Entry names are unique.
/// - Entry names are relative paths that never leave the destination.
#[derive(Debug)]
pub struct ManifestResolver {
    manifest: Manifest,
    index: BTreeMap<String, usize>,
    root: PathBuf,
}

impl ManifestResolver {
    /// Construct new resolver over `manifest`.
    ///
    /// Source files are looked up relative to `root`.
    ///
    /// # Errors
    ///
    /// - Return [`ManifestError::DuplicateEntry`] if two entries share a name.
    /// - Return [`ManifestError::InvalidName`] if an entry name is absolute,
    ///   empty, or climbs out of the destination, or if a new name of a
    ///   renamed directory is anything but a single file name.
    pub fn new(manifest: Manifest, root: impl Into<PathBuf>) -> Result<Self> {
        let mut index = BTreeMap::new();
        for (position, entry) in manifest.entries.iter().enumerate() {
            validate_name(&entry.name)?;
            if let Some(new_name) = &entry.new_name {
                validate_new_name(new_name)?;
            }
            if index.insert(entry.name.clone(), position).is_some() {
                return Err(ManifestError::DuplicateEntry {
                    name: entry.name.clone(),
                });
            }
        }

        Ok(Self {
            manifest,
            index,
            root: root.into(),
        })
    }

    /// Load manifest file at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`ManifestError::Read`] if the file cannot be read.
    /// - Return [`ManifestError::Deserialize`] if the file is not a valid
    ///   manifest.
    /// - Return any error of [`ManifestResolver::new`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| ManifestError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Self::new(data.parse()?, root)
    }

    /// Get manifest being resolved.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn contents(&self, entry: &ManifestEntry) -> Result<LazyContents<'static>> {
        if let Some(contents) = &entry.contents {
            return Ok(LazyContents::new(contents.as_bytes()));
        }

        let source = entry.source.as_ref().ok_or_else(|| missing(entry, "contents or source"))?;
        let path = self.root.join(source);
        Ok(LazyContents::deferred(move || Ok(fs::read(&path)?)))
    }
}

impl Resolver for ManifestResolver {
    type Error = ManifestError;

    fn min_version(&self) -> Option<Version> {
        self.manifest.min_version
    }

    fn target_names(&self) -> Result<Vec<String>> {
        Ok(self.index.keys().cloned().collect())
    }

    fn target_state(&self, name: &str) -> Result<TargetStateEntry> {
        let entry = self
            .index
            .get(name)
            .and_then(|position| self.manifest.entries.get(*position))
            .ok_or_else(|| ManifestError::UnknownTarget {
                name: name.to_string(),
            })?;
        let perm = |default: u32| entry.perm.map_or(default, Mode::bits);

        let target = match entry.kind {
            EntryKind::Absent => TargetStateEntry::Absent,
            EntryKind::Dir => TargetStateEntry::Dir {
                perm: perm(DEFAULT_DIR_PERM),
            },
            EntryKind::File => TargetStateEntry::File {
                perm: perm(DEFAULT_FILE_PERM),
                contents: self.contents(entry)?,
            },
            EntryKind::Present => TargetStateEntry::Present {
                perm: perm(DEFAULT_FILE_PERM),
            },
            EntryKind::Symlink => TargetStateEntry::Symlink {
                linkname: LazyLinkname::new(
                    entry.linkname.as_deref().ok_or_else(|| missing(entry, "linkname"))?,
                ),
            },
            EntryKind::Script => TargetStateEntry::Script {
                name: entry.name.clone(),
                contents: self.contents(entry)?,
            },
            EntryKind::RenameDir => TargetStateEntry::RenameDir {
                new_name: entry
                    .new_name
                    .clone()
                    .ok_or_else(|| missing(entry, "new_name"))?,
            },
        };

        Ok(target)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if !valid {
        return Err(ManifestError::InvalidName {
            name: name.to_string(),
        });
    }

    Ok(())
}

fn validate_new_name(new_name: &str) -> Result<()> {
    if !is_file_name(new_name) {
        return Err(ManifestError::InvalidName {
            name: new_name.to_string(),
        });
    }

    Ok(())
}

fn missing(entry: &ManifestEntry, field: &'static str) -> ManifestError {
    ManifestError::MissingField {
        name: entry.name.clone(),
        field,
    }
}

/// Manifest error types.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Failed to read manifest file.
    #[error("failed to read manifest {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize manifest.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize manifest.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Two entries share a target name.
    #[error("duplicate entry {name:?}")]
    DuplicateEntry { name: String },

    /// Target name is not a relative path inside the destination.
    #[error("invalid target name {name:?}")]
    InvalidName { name: String },

    /// Target name is not in the manifest.
    #[error("unknown target {name:?}")]
    UnknownTarget { name: String },

    /// Entry lacks a field its type needs.
    #[error("entry {name:?} needs {field}")]
    MissingField { name: String, field: &'static str },
}

impl From<ManifestError> for FmtError {
    fn from(_: ManifestError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ManifestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use tempfile::TempDir;

    const MANIFEST: &str = indoc! {r#"
        min_version = "0.1.0"

        [[entry]]
        name = ".config"
        type = "dir"

        [[entry]]
        name = ".config/app.toml"
        type = "file"
        perm = "600"
        source = "files/app.toml"

        [[entry]]
        name = ".bashrc"
        type = "file"
        contents = "export EDITOR=vim\n"

        [[entry]]
        name = ".vimrc"
        type = "symlink"
        linkname = ".config/nvim/init.vim"

        [[entry]]
        name = ".old"
        type = "rename-dir"
        new_name = ".new"

        [[entry]]
        name = "setup.sh"
        type = "script"
        contents = "echo hi"
    "#};

    #[test]
    fn resolve_target_state() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        fs::create_dir(root.path().join("files"))?;
        fs::write(root.path().join("files").join("app.toml"), "key = 1\n")?;
        let resolver = ManifestResolver::new(MANIFEST.parse()?, root.path())?;

        assert_eq!(resolver.min_version(), Some("0.1.0".parse::<Version>()?));
        assert_eq!(
            resolver.target_names()?,
            vec![".bashrc", ".config", ".config/app.toml", ".old", ".vimrc", "setup.sh"]
        );

        match resolver.target_state(".config")? {
            TargetStateEntry::Dir { perm } => assert_eq!(perm, 0o777),
            target => panic!("expected directory, got {target:?}"),
        }
        match resolver.target_state(".config/app.toml")? {
            TargetStateEntry::File { perm, contents } => {
                assert_eq!(perm, 0o600);
                assert_eq!(contents.contents()?, b"key = 1\n");
            }
            target => panic!("expected file, got {target:?}"),
        }
        match resolver.target_state(".bashrc")? {
            TargetStateEntry::File { perm, contents } => {
                assert_eq!(perm, 0o666);
                assert_eq!(contents.contents()?, b"export EDITOR=vim\n");
            }
            target => panic!("expected file, got {target:?}"),
        }
        match resolver.target_state(".old")? {
            TargetStateEntry::RenameDir { new_name } => assert_eq!(new_name, ".new"),
            target => panic!("expected rename, got {target:?}"),
        }
        assert!(resolver.target_state("setup.sh")?.is_script());

        Ok(())
    }

    #[test]
    fn missing_source_fails_lazily() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let resolver = ManifestResolver::new(MANIFEST.parse()?, root.path())?;

        let target = resolver.target_state(".config/app.toml")?;
        let TargetStateEntry::File { contents, .. } = target else {
            panic!("expected file");
        };
        assert!(contents.contents().is_err_and(|err| err.is_not_found()));

        Ok(())
    }

    #[test]
    fn entry_without_required_field() -> anyhow::Result<()> {
        let manifest: Manifest = indoc! {r#"
            [[entry]]
            name = ".vimrc"
            type = "symlink"
        "#}
        .parse()?;
        let resolver = ManifestResolver::new(manifest, "")?;

        assert!(matches!(
            resolver.target_state(".vimrc"),
            Err(ManifestError::MissingField { field: "linkname", .. })
        ));
        assert!(matches!(
            resolver.target_state(".nope"),
            Err(ManifestError::UnknownTarget { .. })
        ));

        Ok(())
    }

    #[test]
    fn reject_duplicate_entries() -> anyhow::Result<()> {
        let manifest: Manifest = indoc! {r#"
            [[entry]]
            name = ".bashrc"
            type = "present"

            [[entry]]
            name = ".bashrc"
            type = "absent"
        "#}
        .parse()?;

        assert!(matches!(
            ManifestResolver::new(manifest, ""),
            Err(ManifestError::DuplicateEntry { name }) if name == ".bashrc"
        ));

        Ok(())
    }

    #[test_case("/etc/passwd"; "absolute")]
    #[test_case("../outside"; "parent")]
    #[test_case(".config/../../outside"; "nested parent")]
    #[test_case(""; "empty")]
    #[test]
    fn reject_invalid_names(name: &str) {
        let manifest = Manifest {
            min_version: None,
            entries: vec![ManifestEntry {
                name: name.into(),
                kind: EntryKind::Absent,
                perm: None,
                contents: None,
                source: None,
                linkname: None,
                new_name: None,
            }],
        };

        assert!(matches!(
            ManifestResolver::new(manifest, ""),
            Err(ManifestError::InvalidName { .. })
        ));
    }

    #[test_case("../../escaped"; "parent")]
    #[test_case("/tmp/escaped"; "absolute")]
    #[test_case("nested/name"; "nested")]
    #[test_case(".."; "dot dot")]
    #[test_case(""; "empty")]
    #[test]
    fn reject_invalid_new_names(new_name: &str) {
        let manifest = Manifest {
            min_version: None,
            entries: vec![ManifestEntry {
                name: "old".into(),
                kind: EntryKind::RenameDir,
                perm: None,
                contents: None,
                source: None,
                linkname: None,
                new_name: Some(new_name.into()),
            }],
        };

        assert!(matches!(
            ManifestResolver::new(manifest, ""),
            Err(ManifestError::InvalidName { .. })
        ));
    }

    #[test]
    fn serialize_manifest() {
        let result = Manifest {
            min_version: Some(Version {
                major: 0,
                minor: 1,
                patch: 0,
            }),
            entries: vec![ManifestEntry {
                name: ".ssh".into(),
                kind: EntryKind::Dir,
                perm: Some(Mode::new(0o700)),
                contents: None,
                source: None,
                linkname: None,
                new_name: None,
            }],
        }
        .to_string();

        let expect = indoc! {r#"
            min_version = "0.1.0"

            [[entry]]
            name = ".ssh"
            type = "dir"
            perm = "700"
        "#};

        assert_eq!(result, expect);
    }
}
