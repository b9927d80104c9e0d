// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Entry state model.
//!
//! A managed entry is described three ways:
//!
//! - [`ActualStateEntry`]: what currently exists at a path.
//! - [`TargetStateEntry`]: what should exist at a path.
//! - [`EntryState`]: fingerprint of what was last applied to a path.
//!
//! Target state knows how to apply itself over actual state through a
//! [`System`], and how to tell whether the two are already equal.
//!
//! [`ActualStateEntry`]: crate::entry::actual::ActualStateEntry
//! [`TargetStateEntry`]: crate::entry::target::TargetStateEntry
//! [`EntryState`]: crate::entry::record::EntryState
//! [`System`]: crate::system::System

pub mod actual;
pub mod lazy;
pub mod record;
pub mod target;

use crate::{store::StoreError, system::SystemError};

use std::path::PathBuf;

/// Entry error types.
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    /// Existing path is neither a regular file, directory, nor symlink.
    #[error("{:?}: unsupported file type {mode:o}", path.display())]
    UnsupportedFileType { path: PathBuf, mode: u32 },

    /// New name of a renamed directory is not a single file name.
    #[error("invalid new name {new_name:?} for {:?}", path.display())]
    InvalidNewName { path: PathBuf, new_name: String },

    /// Include filter names an unknown entry type.
    #[error("invalid include filter {value:?}")]
    InvalidInclude { value: String },

    /// System operation fails.
    #[error(transparent)]
    System(#[from] SystemError),

    /// Persistent state access fails.
    #[error(transparent)]
    PersistentState(#[from] StoreError),

    /// Entry state cannot be encoded or decoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Friendly result alias :3
pub type Result<T, E = EntryError> = std::result::Result<T, E>;
