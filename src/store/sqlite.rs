// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! SQLite backed persistent state.
//!
//! The whole persistent state lives in one SQLite database file. Every bucket
//! is a set of rows in a single table keyed by `(bucket, key)`.
//!
//! # Locking
//!
//! Only one oxistate process may write the persistent state at a time. A
//! sidecar lock file next to the database is locked exclusively by writers and
//! shared by read-only sessions. The lock is acquired within a bounded wait.
//! If the wait runs out, then [`StoreError::LockTimeout`] is returned instead
//! of blocking forever. Writers take the lock when constructed, readers when
//! the database is first opened. The lock is held until the store is dropped.
//!
//! The database is opened lazily. A store whose file does not exist yet reads
//! as empty until [`PersistentState::open_or_create`] or a write creates it.
//! Read-only stores never create anything.

use crate::store::{ForEachFn, PersistentState, Result, StoreError};

use fs4::FileExt;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::{
    cell::RefCell,
    ffi::OsString,
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

/// Default amount of time to wait for the store lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS buckets (
        bucket BLOB NOT NULL,
        key BLOB NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (bucket, key)
    );
";

/// Options for opening a [`SqlitePersistentState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteOptions {
    /// How long to wait for the store lock.
    pub timeout: Duration,

    /// Open the store read-only.
    pub read_only: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            read_only: false,
        }
    }
}

/// Persistent state stored in a SQLite database file.
#[derive(Debug)]
pub struct SqlitePersistentState {
    path: PathBuf,
    options: SqliteOptions,
    lock: RefCell<Option<File>>,
    conn: RefCell<Option<Connection>>,
}

impl SqlitePersistentState {
    /// Construct new SQLite persistent state at `path`.
    ///
    /// Writers take the exclusive lock right away, even if the database does
    /// not exist yet, so that a concurrent writer is turned away before it
    /// changes anything. The database is opened right away only if it
    /// already exists.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::LockTimeout`] if the lock cannot be acquired in
    ///   time.
    /// - Return [`StoreError::Open`] if the lock file or its parent directory
    ///   cannot be created.
    /// - Return [`StoreError::Sqlite`] if the database cannot be opened.
    #[instrument(skip(path), level = "debug")]
    pub fn new(path: impl Into<PathBuf>, options: SqliteOptions) -> Result<Self> {
        let state = Self {
            path: path.into(),
            options,
            lock: RefCell::new(None),
            conn: RefCell::new(None),
        };

        if !options.read_only {
            state.create_parent()?;
            state.lock()?;
        }

        if state.path.exists() {
            state.open()?;
        }

        Ok(state)
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn create_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(|err| StoreError::Open {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        Ok(())
    }

    fn lock(&self) -> Result<()> {
        if self.lock.borrow().is_none() {
            let lock = self.acquire_lock()?;
            *self.lock.borrow_mut() = Some(lock);
        }

        Ok(())
    }

    fn open(&self) -> Result<()> {
        if self.conn.borrow().is_some() {
            return Ok(());
        }

        self.lock()?;
        let conn = if self.options.read_only {
            Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else {
            let conn = Connection::open(&self.path)?;
            conn.execute_batch(SCHEMA)?;
            conn
        };
        conn.busy_timeout(self.options.timeout)?;
        debug!("opened persistent state {:?}", self.path.display());

        *self.conn.borrow_mut() = Some(conn);

        Ok(())
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| StoreError::Open {
                source: err,
                path: lock_path.clone(),
            })?;

        let start = Instant::now();
        loop {
            // INVARIANT: Call through the trait so inherent std file locking
            // methods are never picked instead.
            let attempt = if self.options.read_only {
                FileExt::try_lock_shared(&file)
            } else {
                FileExt::try_lock_exclusive(&file)
            };

            match attempt {
                Ok(()) => return Ok(file),
                Err(err) if is_contended(&err) => {
                    if start.elapsed() >= self.options.timeout {
                        return Err(StoreError::LockTimeout {
                            path: self.path.clone(),
                            timeout: self.options.timeout,
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(StoreError::Open {
                        source: err,
                        path: lock_path,
                    })
                }
            }
        }
    }

    fn with_conn<T>(&self, func: impl FnOnce(&Connection) -> Result<T>) -> Result<Option<T>> {
        match self.conn.borrow().as_ref() {
            Some(conn) => func(conn).map(Some),
            None => Ok(None),
        }
    }
}

impl PersistentState for SqlitePersistentState {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM buckets WHERE bucket = ?1 AND key = ?2",
                    params![bucket, key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?)
        })?;

        Ok(value.flatten())
    }

    fn set(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        if self.options.read_only {
            return Err(StoreError::PermissionDenied);
        }

        self.open_or_create()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
                params![bucket, key, value],
            )?;
            Ok(())
        })?;

        Ok(())
    }

    fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        if self.options.read_only {
            return Err(StoreError::PermissionDenied);
        }

        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM buckets WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
            )?;
            Ok(())
        })?;

        Ok(())
    }

    fn for_each(&self, bucket: &[u8], func: &mut ForEachFn<'_>) -> Result<()> {
        let pairs = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM buckets WHERE bucket = ?1 ORDER BY key")?;
            let rows = stmt
                .query_map(params![bucket], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        for (key, value) in pairs.unwrap_or_default() {
            func(&key, &value)?;
        }

        Ok(())
    }

    fn open_or_create(&self) -> Result<()> {
        if self.conn.borrow().is_some() {
            return Ok(());
        }

        if !self.options.read_only {
            self.create_parent()?;
        }

        self.open()
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    if err.kind() == ErrorKind::WouldBlock {
        return true;
    }

    // Windows reports sharing and lock violations as raw errors.
    #[cfg(windows)]
    if matches!(err.raw_os_error(), Some(32 | 33)) {
        return true;
    }

    false
}
