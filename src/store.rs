// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Persistent state management.
//!
//! Oxistate remembers what it did between runs through the __persistent
//! state__. The persistent state is a mapping of named __buckets__, where each
//! bucket maps keys to values. Buckets, keys, and values are all plain byte
//! sequences. Keys are unique within a bucket.
//!
//! # Reserved Buckets
//!
//! Two buckets have a fixed meaning:
//!
//! - [`ENTRY_STATE_BUCKET`] maps a target name to the JSON encoded
//!   [`EntryState`] of its last successful apply.
//! - [`SCRIPT_ONCE_STATE_BUCKET`] maps the SHA-256 of a script body to a
//!   marker value. Presence of the key means the script already ran.
//!
//! # Decorators
//!
//! Every store implements [`PersistentState`]. Behavior is layered on top of a
//! store by wrapping it in one of the decorators from [`decorate`], e.g., a
//! [`ReadOnlyPersistentState`] rejects all writes, while a
//! [`DryRunPersistentState`] swallows them and only records that a write was
//! attempted. Decorators never change the store they wrap.
//!
//! [`EntryState`]: crate::entry::record::EntryState
//! [`ReadOnlyPersistentState`]: crate::store::decorate::ReadOnlyPersistentState
//! [`DryRunPersistentState`]: crate::store::decorate::DryRunPersistentState

pub mod decorate;
pub mod memory;
pub mod sqlite;

use crate::entry::record::EntryState;

use serde_json::{Map, Value};
use std::{path::PathBuf, rc::Rc, time::Duration};

/// Bucket holding the entry state of each applied target name.
pub const ENTRY_STATE_BUCKET: &[u8] = b"entryState";

/// Bucket holding once-markers of scripts keyed by content hash.
pub const SCRIPT_ONCE_STATE_BUCKET: &[u8] = b"scriptOnce";

/// Callback used to visit each key/value pair of a bucket.
pub type ForEachFn<'a> = dyn FnMut(&[u8], &[u8]) -> Result<()> + 'a;

/// Bucketed key/value store.
///
/// All methods take `&self`. Implementations that need to track changes do
/// so through interior mutability, which lets the same store be observed
/// through several [`System`](crate::system::System) layers at once.
pub trait PersistentState {
    /// Get value of `key` in `bucket`.
    ///
    /// Returns `None` if either the bucket or the key does not exist.
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Set `key` in `bucket` to `value`, creating the bucket if needed.
    fn set(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete `key` from `bucket`.
    ///
    /// Deleting a missing key is not an error.
    fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<()>;

    /// Visit every key/value pair of `bucket`.
    ///
    /// Iteration stops at the first error returned by `func`, and that exact
    /// error is returned to the caller.
    fn for_each(&self, bucket: &[u8], func: &mut ForEachFn<'_>) -> Result<()>;

    /// Open the store, creating it if it does not exist yet.
    fn open_or_create(&self) -> Result<()>;
}

impl<S> PersistentState for Rc<S>
where
    S: PersistentState + ?Sized,
{
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(bucket, key)
    }

    fn set(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        (**self).set(bucket, key, value)
    }

    fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        (**self).delete(bucket, key)
    }

    fn for_each(&self, bucket: &[u8], func: &mut ForEachFn<'_>) -> Result<()> {
        (**self).for_each(bucket, func)
    }

    fn open_or_create(&self) -> Result<()> {
        (**self).open_or_create()
    }
}

/// Render the contents of a bucket as JSON.
///
/// Values of [`ENTRY_STATE_BUCKET`] are decoded into [`EntryState`] objects.
/// Keys of [`SCRIPT_ONCE_STATE_BUCKET`] are raw hashes, so they are hex
/// encoded. Everything else is rendered as lossy UTF-8.
///
/// # Errors
///
/// - Return [`StoreError::Json`] if a stored entry state cannot be decoded.
/// - Return any error produced by the store itself.
pub fn state_data(state: &dyn PersistentState, bucket: &[u8]) -> Result<Value> {
    let mut data = Map::new();
    state.for_each(bucket, &mut |key, value| {
        let (key, value) = if bucket == ENTRY_STATE_BUCKET {
            let entry_state: EntryState = serde_json::from_slice(value)?;
            (
                String::from_utf8_lossy(key).into_owned(),
                serde_json::to_value(entry_state)?,
            )
        } else if bucket == SCRIPT_ONCE_STATE_BUCKET {
            (
                hex::encode(key),
                serde_json::from_slice::<Value>(value)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(value).into_owned())),
            )
        } else {
            (
                String::from_utf8_lossy(key).into_owned(),
                Value::String(String::from_utf8_lossy(value).into_owned()),
            )
        };
        data.insert(key, value);
        Ok(())
    })?;

    Ok(Value::Object(data))
}

/// Persistent state error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Write attempted on a read-only store.
    #[error("permission denied: persistent state is read-only")]
    PermissionDenied,

    /// Store lock could not be acquired in time.
    #[error(
        "timeout obtaining persistent state lock on {:?} after {timeout:?}, is another instance running?",
        path.display()
    )]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// Store file cannot be created or opened.
    #[error("failed to open persistent state at {:?}", path.display())]
    Open {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Underlying database operation fails.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// Stored value cannot be encoded or decoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic I/O failure, also used by callers to stop iteration early.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
