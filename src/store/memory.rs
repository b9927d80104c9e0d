// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! In-memory persistent state.
//!
//! Nothing survives the process. Useful for throwaway sessions where state
//! should still be observable for the length of a run, and for testing.

use crate::store::{ForEachFn, PersistentState, Result};

use std::{cell::RefCell, collections::BTreeMap};

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

/// Persistent state held entirely in memory.
///
/// Keys are visited in byte order, so iteration is stable.
#[derive(Debug, Default)]
pub struct MemoryPersistentState {
    buckets: RefCell<BTreeMap<Vec<u8>, Bucket>>,
}

impl MemoryPersistentState {
    /// Construct new empty in-memory state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentState for MemoryPersistentState {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .borrow()
            .get(bucket)
            .and_then(|bucket| bucket.get(key))
            .cloned())
    }

    fn set(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.buckets
            .borrow_mut()
            .entry(bucket.to_vec())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        if let Some(bucket) = self.buckets.borrow_mut().get_mut(bucket) {
            bucket.remove(key);
        }
        Ok(())
    }

    fn for_each(&self, bucket: &[u8], func: &mut ForEachFn<'_>) -> Result<()> {
        // INVARIANT: Snapshot the bucket so the callback may touch the store.
        let pairs = self.buckets.borrow().get(bucket).cloned().unwrap_or_default();
        for (key, value) in &pairs {
            func(key, value)?;
        }

        Ok(())
    }

    fn open_or_create(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use pretty_assertions::assert_eq;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn set_get_delete_round_trip() -> anyhow::Result<()> {
        let state = MemoryPersistentState::new();
        state.open_or_create()?;

        // Deleting something that was never there is fine.
        state.delete(b"bucket", b"value")?;
        assert_eq!(state.get(b"bucket", b"key")?, None);

        state.set(b"bucket", b"key", b"value")?;
        assert_eq!(state.get(b"bucket", b"key")?, Some(b"value".to_vec()));

        let mut visited = Vec::new();
        state.for_each(b"bucket", &mut |key, value| {
            visited.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        assert_eq!(visited, vec![(b"key".to_vec(), b"value".to_vec())]);

        state.delete(b"bucket", b"key")?;
        assert_eq!(state.get(b"bucket", b"key")?, None);

        Ok(())
    }

    #[test]
    fn for_each_propagates_callback_error() -> anyhow::Result<()> {
        let state = MemoryPersistentState::new();
        state.set(b"bucket", b"a", b"1")?;
        state.set(b"bucket", b"b", b"2")?;

        let mut calls = 0;
        let result = state.for_each(b"bucket", &mut |_, _| {
            calls += 1;
            Err(IoError::from(ErrorKind::UnexpectedEof).into())
        });

        assert!(matches!(result, Err(StoreError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof));
        assert_eq!(calls, 1);

        Ok(())
    }
}
