// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Persistent state decorators.
//!
//! Each decorator exclusively owns the store it wraps, and forwards or
//! intercepts calls to it. Decorators compose by nesting.

use crate::store::{ForEachFn, PersistentState, Result, StoreError};

use std::cell::Cell;
use tracing::debug;

/// Reject all writes with [`StoreError::PermissionDenied`].
///
/// Reads pass through to the wrapped store.
#[derive(Debug)]
pub struct ReadOnlyPersistentState<S> {
    state: S,
}

impl<S> ReadOnlyPersistentState<S>
where
    S: PersistentState,
{
    /// Wrap `state` as read-only.
    pub fn new(state: S) -> Self {
        Self { state }
    }
}

impl<S> PersistentState for ReadOnlyPersistentState<S>
where
    S: PersistentState,
{
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.state.get(bucket, key)
    }

    fn set(&self, _bucket: &[u8], _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(StoreError::PermissionDenied)
    }

    fn delete(&self, _bucket: &[u8], _key: &[u8]) -> Result<()> {
        Err(StoreError::PermissionDenied)
    }

    fn for_each(&self, bucket: &[u8], func: &mut ForEachFn<'_>) -> Result<()> {
        self.state.for_each(bucket, func)
    }

    fn open_or_create(&self) -> Result<()> {
        self.state.open_or_create()
    }
}

/// Drop all writes, but remember that they happened.
///
/// Reads still see the wrapped store as it was, so a read after a swallowed
/// write does not observe that write.
#[derive(Debug)]
pub struct DryRunPersistentState<S> {
    state: S,
    modified: Cell<bool>,
}

impl<S> DryRunPersistentState<S>
where
    S: PersistentState,
{
    /// Wrap `state` for dry runs.
    pub fn new(state: S) -> Self {
        Self {
            state,
            modified: Cell::new(false),
        }
    }

    /// Check if a write was attempted.
    pub fn modified(&self) -> bool {
        self.modified.get()
    }
}

impl<S> PersistentState for DryRunPersistentState<S>
where
    S: PersistentState,
{
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.state.get(bucket, key)
    }

    fn set(&self, _bucket: &[u8], _key: &[u8], _value: &[u8]) -> Result<()> {
        self.modified.set(true);
        Ok(())
    }

    fn delete(&self, _bucket: &[u8], _key: &[u8]) -> Result<()> {
        self.modified.set(true);
        Ok(())
    }

    fn for_each(&self, bucket: &[u8], func: &mut ForEachFn<'_>) -> Result<()> {
        self.state.for_each(bucket, func)
    }

    // TODO: Split open from create so that opening an existing store does not
    // count as a modification.
    fn open_or_create(&self) -> Result<()> {
        self.modified.set(true);
        self.state.open_or_create()
    }
}

/// Log every call at debug level.
#[derive(Debug)]
pub struct DebugPersistentState<S> {
    state: S,
}

impl<S> DebugPersistentState<S>
where
    S: PersistentState,
{
    /// Wrap `state` with logging.
    pub fn new(state: S) -> Self {
        Self { state }
    }
}

impl<S> PersistentState for DebugPersistentState<S>
where
    S: PersistentState,
{
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let result = self.state.get(bucket, key);
        let value = result.as_ref().ok().and_then(Option::as_deref).map(lossy);
        debug!(
            bucket = %lossy(bucket),
            key = %lossy(key),
            value = ?value,
            error = ?result.as_ref().err(),
            "Get"
        );
        result
    }

    fn set(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.state.set(bucket, key, value);
        debug!(
            bucket = %lossy(bucket),
            key = %lossy(key),
            value = %lossy(value),
            error = ?result.as_ref().err(),
            "Set"
        );
        result
    }

    fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        let result = self.state.delete(bucket, key);
        debug!(
            bucket = %lossy(bucket),
            key = %lossy(key),
            error = ?result.as_ref().err(),
            "Delete"
        );
        result
    }

    fn for_each(&self, bucket: &[u8], func: &mut ForEachFn<'_>) -> Result<()> {
        let result = self.state.for_each(bucket, &mut |key, value| {
            let result = func(key, value);
            debug!(
                bucket = %lossy(bucket),
                key = %lossy(key),
                value = %lossy(value),
                error = ?result.as_ref().err(),
                "ForEach"
            );
            result
        });
        debug!(bucket = %lossy(bucket), error = ?result.as_ref().err(), "ForEach");
        result
    }

    fn open_or_create(&self) -> Result<()> {
        let result = self.state.open_or_create();
        debug!(error = ?result.as_ref().err(), "OpenOrCreate");
        result
    }
}

/// Empty store that consumes all writes.
///
/// Every read returns nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistentState;

impl PersistentState for NullPersistentState {
    fn get(&self, _bucket: &[u8], _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set(&self, _bucket: &[u8], _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _bucket: &[u8], _key: &[u8]) -> Result<()> {
        Ok(())
    }

    fn for_each(&self, _bucket: &[u8], _func: &mut ForEachFn<'_>) -> Result<()> {
        Ok(())
    }

    fn open_or_create(&self) -> Result<()> {
        Ok(())
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryPersistentState;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn seeded() -> anyhow::Result<Rc<MemoryPersistentState>> {
        let state = Rc::new(MemoryPersistentState::new());
        state.set(b"bucket", b"key", b"value")?;
        Ok(state)
    }

    #[test]
    fn read_only_rejects_writes() -> anyhow::Result<()> {
        let inner = seeded()?;
        let state = ReadOnlyPersistentState::new(Rc::clone(&inner));

        assert_eq!(state.get(b"bucket", b"key")?, Some(b"value".to_vec()));
        assert!(matches!(
            state.set(b"bucket", b"key", b"other"),
            Err(StoreError::PermissionDenied)
        ));
        assert!(matches!(
            state.delete(b"bucket", b"key"),
            Err(StoreError::PermissionDenied)
        ));

        // Underlying store is untouched.
        assert_eq!(inner.get(b"bucket", b"key")?, Some(b"value".to_vec()));

        Ok(())
    }

    #[test]
    fn dry_run_swallows_writes_and_reads_stay_stale() -> anyhow::Result<()> {
        let inner = seeded()?;
        let state = DryRunPersistentState::new(Rc::clone(&inner));
        assert!(!state.modified());

        state.set(b"bucket", b"key", b"other")?;
        state.set(b"bucket", b"new", b"value")?;
        assert!(state.modified());

        // Reads do not reflect the hypothetical writes.
        assert_eq!(state.get(b"bucket", b"key")?, Some(b"value".to_vec()));
        assert_eq!(state.get(b"bucket", b"new")?, None);

        state.delete(b"bucket", b"key")?;
        assert_eq!(inner.get(b"bucket", b"key")?, Some(b"value".to_vec()));

        Ok(())
    }

    #[test]
    fn debug_passes_through() -> anyhow::Result<()> {
        let inner = seeded()?;
        let state = DebugPersistentState::new(Rc::clone(&inner));

        state.set(b"bucket", b"other", b"thing")?;
        assert_eq!(inner.get(b"bucket", b"other")?, Some(b"thing".to_vec()));

        let mut keys = Vec::new();
        state.for_each(b"bucket", &mut |key, _| {
            keys.push(key.to_vec());
            Ok(())
        })?;
        assert_eq!(keys, vec![b"key".to_vec(), b"other".to_vec()]);

        state.delete(b"bucket", b"key")?;
        assert_eq!(state.get(b"bucket", b"key")?, None);

        Ok(())
    }

    #[test]
    fn null_state_is_always_empty() -> anyhow::Result<()> {
        let state = NullPersistentState;
        state.set(b"bucket", b"key", b"value")?;
        assert_eq!(state.get(b"bucket", b"key")?, None);

        let mut visited = 0;
        state.for_each(b"bucket", &mut |_, _| {
            visited += 1;
            Ok(())
        })?;
        assert_eq!(visited, 0);

        Ok(())
    }
}
