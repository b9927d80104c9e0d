// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System that describes its mutations as a git diff.
//!
//! Every mutation is rendered as a git-style unified diff against the current
//! state of the inner system, and then forwarded to it. Wrap a
//! [`DryRunSystem`] to preview changes without performing them.
//!
//! # Modes
//!
//! Git only knows a handful of modes, so permission bits are collapsed into
//! them:
//!
//! - `100644` for regular files.
//! - `100755` for regular files with any execute bit set, and scripts.
//! - `120000` for symbolic links, whose "contents" is the link target.
//! - `040000` for directories, which never have contents.
//!
//! [`DryRunSystem`]: crate::system::dry_run::DryRunSystem

use crate::{
    store::PersistentState,
    system::{perm_of, Result, System},
};

use similar::TextDiff;
use std::{
    cell::RefCell,
    collections::BTreeSet,
    fs::Metadata,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    rc::Rc,
    str,
};

const MODE_DIR: u32 = 0o040000;
const MODE_SYMLINK: u32 = 0o120000;
const MODE_FILE: u32 = 0o100644;
const MODE_EXECUTABLE: u32 = 0o100755;

/// Render mutations as git diffs into a writer.
pub struct GitDiffSystem<S, W> {
    system: S,
    writer: RefCell<W>,
    dir_prefix: PathBuf,
    removed: RefCell<BTreeSet<PathBuf>>,
}

impl<S, W> GitDiffSystem<S, W>
where
    S: System,
    W: Write,
{
    /// Wrap `system`, writing diffs into `writer`.
    ///
    /// Paths in diffs are shown relative to `dir_prefix`.
    pub fn new(system: S, writer: W, dir_prefix: impl Into<PathBuf>) -> Self {
        Self {
            system,
            writer: RefCell::new(writer),
            dir_prefix: dir_prefix.into(),
            removed: RefCell::new(BTreeSet::new()),
        }
    }

    /// Give back the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn name(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.dir_prefix).unwrap_or(path);
        relative
            .to_string_lossy()
            .replace('\\', "/")
            .trim_start_matches('/')
            .to_string()
    }

    fn old_entry(&self, path: &Path) -> Result<Option<(u32, Vec<u8>)>> {
        // INVARIANT: Paths already shown as deleted are gone, even if the
        //   inner system never removed them.
        let removed = self.removed.borrow();
        if path.ancestors().any(|ancestor| removed.contains(ancestor)) {
            return Ok(None);
        }
        drop(removed);

        let metadata = match self.system.lstat(path) {
            Ok(metadata) => metadata,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let contents = if metadata.is_symlink() {
            self.system
                .readlink(path)?
                .to_string_lossy()
                .into_owned()
                .into_bytes()
        } else if metadata.is_file() {
            self.system.read_file(path)?
        } else {
            Vec::new()
        };

        Ok(Some((git_mode(&metadata), contents)))
    }

    fn write_diff(
        &self,
        path: &Path,
        old: Option<(u32, &[u8])>,
        new: Option<(u32, &[u8])>,
    ) -> Result<()> {
        if old == new {
            return Ok(());
        }

        let diff = render(&self.name(path), old, new);
        self.writer.borrow_mut().write_all(diff.as_bytes())?;

        Ok(())
    }
}

impl<S, W> System for GitDiffSystem<S, W>
where
    S: System,
    W: Write,
{
    fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
        if let Some((mode, contents)) = self.old_entry(path)? {
            // INVARIANT: Git does not track directory permissions.
            if mode != MODE_DIR {
                self.write_diff(
                    path,
                    Some((mode, contents.as_slice())),
                    Some((file_mode(perm), contents.as_slice())),
                )?;
            }
        }

        self.system.chmod(path, perm)
    }

    fn create_symlink(&self, path: &Path, target: &Path) -> Result<()> {
        let old = self.old_entry(path)?;
        let linkname = target.to_string_lossy();
        self.write_diff(
            path,
            old.as_ref().map(|(mode, contents)| (*mode, contents.as_slice())),
            Some((MODE_SYMLINK, linkname.as_bytes())),
        )?;
        self.removed.borrow_mut().remove(path);

        self.system.create_symlink(path, target)
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        self.system.idempotent_cmd_output(cmd)
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        self.system.lstat(path)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        self.write_diff(path, None, Some((MODE_DIR, b"".as_slice())))?;
        self.removed.borrow_mut().remove(path);
        self.system.mkdir(path, perm)
    }

    fn persistent_state(&self) -> Rc<dyn PersistentState> {
        self.system.persistent_state()
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
        if let Some((mode, contents)) = self.old_entry(path)? {
            self.write_diff(path, Some((mode, contents.as_slice())), None)?;
            self.removed.borrow_mut().insert(path.to_path_buf());
        }

        self.system.remove_all(path)
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let (old_name, new_name) = (self.name(old), self.name(new));
        write!(
            self.writer.borrow_mut(),
            "diff --git a/{old_name} b/{new_name}\nrename from {old_name}\nrename to {new_name}\n"
        )?;

        self.system.rename(old, new)
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        self.system.run_cmd(cmd)
    }

    fn run_script(&self, name: &str, dir: &Path, data: &[u8]) -> Result<()> {
        self.write_diff(Path::new(name), None, Some((MODE_EXECUTABLE, data)))?;
        self.system.run_script(name, dir, data)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        self.system.stat(path)
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
        let old = self.old_entry(path)?;
        self.write_diff(
            path,
            old.as_ref().map(|(mode, contents)| (*mode, contents.as_slice())),
            Some((file_mode(perm), data)),
        )?;
        self.removed.borrow_mut().remove(path);

        self.system.write_file(path, data, perm)
    }
}

fn file_mode(perm: u32) -> u32 {
    if perm & 0o111 != 0 {
        MODE_EXECUTABLE
    } else {
        MODE_FILE
    }
}

fn git_mode(metadata: &Metadata) -> u32 {
    if metadata.is_dir() {
        MODE_DIR
    } else if metadata.is_symlink() {
        MODE_SYMLINK
    } else {
        file_mode(perm_of(metadata))
    }
}

fn render(name: &str, old: Option<(u32, &[u8])>, new: Option<(u32, &[u8])>) -> String {
    let mut diff = format!("diff --git a/{name} b/{name}\n");
    match (old, new) {
        (None, Some((mode, _))) => diff.push_str(&format!("new file mode {mode:06o}\n")),
        (Some((mode, _)), None) => diff.push_str(&format!("deleted file mode {mode:06o}\n")),
        (Some((old_mode, _)), Some((new_mode, _))) if old_mode != new_mode => {
            diff.push_str(&format!("old mode {old_mode:06o}\nnew mode {new_mode:06o}\n"));
        }
        _ => {}
    }

    let old_label = old.map_or_else(|| "/dev/null".to_string(), |_| format!("a/{name}"));
    let new_label = new.map_or_else(|| "/dev/null".to_string(), |_| format!("b/{name}"));
    let old_contents = old.map(|(_, contents)| contents).unwrap_or_default();
    let new_contents = new.map(|(_, contents)| contents).unwrap_or_default();

    match (str::from_utf8(old_contents), str::from_utf8(new_contents)) {
        (Ok(old_text), Ok(new_text)) => {
            let text_diff = TextDiff::from_lines(old_text, new_text);
            diff.push_str(
                &text_diff
                    .unified_diff()
                    .header(&old_label, &new_label)
                    .to_string(),
            );
        }
        _ if old_contents != new_contents => {
            diff.push_str(&format!("Binary files {old_label} and {new_label} differ\n"));
        }
        _ => {}
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::memory::MemoryPersistentState,
        system::{dry_run::DryRunSystem, real::RealSystem},
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn diff_system(dir: &TempDir) -> GitDiffSystem<DryRunSystem<RealSystem>, Vec<u8>> {
        let system = DryRunSystem::new(RealSystem::new(MemoryPersistentState::new()));
        GitDiffSystem::new(system, Vec::new(), dir.path())
    }

    #[test]
    fn new_file_diff() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let system = diff_system(&dir);

        system.write_file(&dir.path().join("file"), b"hello\n", 0o644)?;
        let expect = indoc! {"
            diff --git a/file b/file
            new file mode 100644
            --- /dev/null
            +++ b/file
            @@ -0,0 +1 @@
            +hello
        "};
        assert_eq!(String::from_utf8(system.into_inner())?, expect);
        assert!(!dir.path().join("file").exists());

        Ok(())
    }

    #[test]
    fn modified_file_diff() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file");
        RealSystem::new(MemoryPersistentState::new()).write_file(&path, b"old\n", 0o644)?;
        let system = diff_system(&dir);

        system.write_file(&path, b"new\n", 0o755)?;
        let result = String::from_utf8(system.into_inner())?;
        assert!(result.starts_with("diff --git a/file b/file\nold mode 100644\nnew mode 100755\n"));
        assert!(result.contains("--- a/file\n+++ b/file\n"));
        assert!(result.contains("-old\n+new\n"));

        Ok(())
    }

    #[test]
    fn unchanged_file_produces_no_diff() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file");
        RealSystem::new(MemoryPersistentState::new()).write_file(&path, b"same\n", 0o644)?;
        let system = diff_system(&dir);

        system.write_file(&path, b"same\n", 0o600)?;
        assert_eq!(system.into_inner(), b"");

        Ok(())
    }

    #[test]
    fn structural_changes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let old = dir.path().join("old");
        RealSystem::new(MemoryPersistentState::new()).write_file(&old, b"gone\n", 0o644)?;
        let system = diff_system(&dir);

        system.mkdir(&dir.path().join("dir"), 0o755)?;
        system.create_symlink(&dir.path().join("link"), Path::new("target"))?;
        system.rename(&old, &dir.path().join("new"))?;
        system.remove_all(&old)?;
        system.run_script("script.sh", dir.path(), b"echo hi\n")?;

        let result = String::from_utf8(system.into_inner())?;
        assert!(result.contains("diff --git a/dir b/dir\nnew file mode 040000\n"));
        assert!(result.contains("new file mode 120000\n--- /dev/null\n+++ b/link\n"));
        assert!(result.contains("rename from old\nrename to new\n"));
        assert!(result.contains("deleted file mode 100644\n--- a/old\n+++ /dev/null\n"));
        assert!(result.contains("diff --git a/script.sh b/script.sh\nnew file mode 100755\n"));
        assert!(result.contains("+echo hi\n"));

        Ok(())
    }

    #[test]
    fn file_replacing_directory_is_new_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("entry");
        RealSystem::new(MemoryPersistentState::new()).mkdir(&path, 0o755)?;
        let system = diff_system(&dir);

        system.remove_all(&path)?;
        system.write_file(&path, b"hello\n", 0o644)?;
        let expect = indoc! {"
            diff --git a/entry b/entry
            deleted file mode 040000
            diff --git a/entry b/entry
            new file mode 100644
            --- /dev/null
            +++ b/entry
            @@ -0,0 +1 @@
            +hello
        "};
        assert_eq!(String::from_utf8(system.into_inner())?, expect);

        Ok(())
    }

    #[test]
    fn binary_contents() {
        let diff = render("bin", Some((MODE_FILE, &b"\xff\x00"[..])), Some((MODE_FILE, &b"\xfe"[..])));
        assert_eq!(
            diff,
            "diff --git a/bin b/bin\nBinary files a/bin and b/bin differ\n"
        );
    }
}
