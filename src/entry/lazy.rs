// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deferred entry data.
//!
//! Reading file contents or resolving a link target can be expensive, and is
//! often not needed at all, e.g., a directory never needs the contents of the
//! file it replaces. So, entries hold their data as memoized thunks that
//! compute their value at most once per instance.

use crate::system::Result;

use sha2::{Digest, Sha256};
use std::{
    cell::OnceCell,
    fmt::{Debug, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};

type Thunk<'a, T> = Box<dyn Fn() -> Result<T> + 'a>;

/// Memoized value computed on first request.
pub struct Lazy<'a, T> {
    value: OnceCell<T>,
    func: Option<Thunk<'a, T>>,
}

impl<'a, T> Lazy<'a, T> {
    /// Construct lazy value that is already known.
    pub fn ready(value: T) -> Self {
        Self {
            value: OnceCell::from(value),
            func: None,
        }
    }

    /// Construct lazy value computed by `func` on first request.
    pub fn deferred(func: impl Fn() -> Result<T> + 'a) -> Self {
        Self {
            value: OnceCell::new(),
            func: Some(Box::new(func)),
        }
    }

    /// Get value, computing it if needed.
    ///
    /// Failures are not cached, the next call tries again.
    ///
    /// # Errors
    ///
    /// - Return whatever error the deferred computation produced.
    pub fn get(&self) -> Result<&T>
    where
        T: Default,
    {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let value = match &self.func {
            Some(func) => func()?,
            None => T::default(),
        };

        Ok(self.value.get_or_init(|| value))
    }
}

impl<T> Default for Lazy<'_, T> {
    fn default() -> Self {
        Self {
            value: OnceCell::new(),
            func: None,
        }
    }
}

impl<T> Debug for Lazy<'_, T>
where
    T: Debug,
{
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self.value.get() {
            Some(value) => fmt.debug_tuple("Lazy").field(value).finish(),
            None => fmt.write_str("Lazy(<deferred>)"),
        }
    }
}

/// Lazily read file contents.
///
/// The SHA-256 of the contents is memoized separately, so comparing two
/// files by hash computes each digest once.
#[derive(Debug, Default)]
pub struct LazyContents<'a> {
    contents: Lazy<'a, Vec<u8>>,
    sha256: OnceCell<Vec<u8>>,
}

impl<'a> LazyContents<'a> {
    /// Construct contents that are already known.
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: Lazy::ready(contents.into()),
            sha256: OnceCell::new(),
        }
    }

    /// Construct contents read by `func` on first request.
    pub fn deferred(func: impl Fn() -> Result<Vec<u8>> + 'a) -> Self {
        Self {
            contents: Lazy::deferred(func),
            sha256: OnceCell::new(),
        }
    }

    /// Get contents.
    ///
    /// # Errors
    ///
    /// - Return whatever error reading the contents produced.
    pub fn contents(&self) -> Result<&[u8]> {
        self.contents.get().map(Vec::as_slice)
    }

    /// Get SHA-256 of contents.
    ///
    /// # Errors
    ///
    /// - Return whatever error reading the contents produced.
    pub fn contents_sha256(&self) -> Result<&[u8]> {
        if let Some(sha256) = self.sha256.get() {
            return Ok(sha256);
        }

        let sha256 = sha256_sum(self.contents()?);
        Ok(self.sha256.get_or_init(|| sha256))
    }
}

/// Lazily resolved symlink target.
#[derive(Debug, Default)]
pub struct LazyLinkname<'a> {
    linkname: Lazy<'a, PathBuf>,
}

impl<'a> LazyLinkname<'a> {
    /// Construct link target that is already known.
    pub fn new(linkname: impl Into<PathBuf>) -> Self {
        Self {
            linkname: Lazy::ready(linkname.into()),
        }
    }

    /// Construct link target resolved by `func` on first request.
    pub fn deferred(func: impl Fn() -> Result<PathBuf> + 'a) -> Self {
        Self {
            linkname: Lazy::deferred(func),
        }
    }

    /// Get link target.
    ///
    /// # Errors
    ///
    /// - Return whatever error resolving the link target produced.
    pub fn linkname(&self) -> Result<&Path> {
        self.linkname.get().map(PathBuf::as_path)
    }
}

/// Compute SHA-256 of `data`.
pub fn sha256_sum(data: impl AsRef<[u8]>) -> Vec<u8> {
    Sha256::digest(data.as_ref()).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SystemError;
    use pretty_assertions::assert_eq;
    use std::{
        cell::Cell,
        io::{Error as IoError, ErrorKind},
    };

    #[test]
    fn deferred_contents_computed_once() -> anyhow::Result<()> {
        let calls = Cell::new(0);
        let contents = LazyContents::deferred(|| {
            calls.set(calls.get() + 1);
            Ok(b"# contents of .bashrc\n".to_vec())
        });
        assert_eq!(calls.get(), 0);

        assert_eq!(contents.contents()?, b"# contents of .bashrc\n");
        assert_eq!(contents.contents_sha256()?, sha256_sum(b"# contents of .bashrc\n"));
        assert_eq!(contents.contents()?, b"# contents of .bashrc\n");
        assert_eq!(calls.get(), 1);

        Ok(())
    }

    #[test]
    fn default_contents_are_empty() -> anyhow::Result<()> {
        let contents = LazyContents::default();
        assert_eq!(contents.contents()?, b"");
        assert_eq!(
            hex::encode(contents.contents_sha256()?),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        Ok(())
    }

    #[test]
    fn failed_computation_is_retried() {
        let calls = Cell::new(0);
        let linkname = LazyLinkname::deferred(|| {
            calls.set(calls.get() + 1);
            Err(SystemError::Io(IoError::from(ErrorKind::NotFound)))
        });

        assert!(linkname.linkname().is_err());
        assert!(linkname.linkname().is_err());
        assert_eq!(calls.get(), 2);
    }
}
