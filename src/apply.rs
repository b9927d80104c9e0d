// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reconciliation of the destination against target state.
//!
//! A [`Reconciler`] asks a [`Resolver`] for the target state of each managed
//! target name, and drives every one of them through the same steps:
//!
//! 1. Resolve the target state.
//! 2. Inspect the actual state of the destination path.
//! 3. Apply the target over the actual state.
//! 4. Optionally verify that the two are now equal.
//! 5. Persist the entry state fingerprint.
//!
//! Each target name ends up [`Status::Applied`], [`Status::Skipped`], or
//! failed. Target names are processed one at a time in sorted order, so parent
//! directories are handled before their children.
//!
//! # Keep going
//!
//! By default the first failure aborts the whole run, leaving the remaining
//! target names untouched. With keep going enabled, failures are logged and
//! collected into the run [`Summary`] instead.

use crate::{
    entry::{
        actual::ActualStateEntry,
        target::{IncludeSet, TargetStateEntry},
        EntryError,
    },
    store::{StoreError, ENTRY_STATE_BUCKET},
    system::System,
};

use serde::{Deserialize, Serialize};
use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
    str::FromStr,
};
use tracing::{debug, error, info, instrument};

/// Source of truth for target state.
pub trait Resolver {
    /// Failure to resolve target state.
    type Error: StdError + Send + Sync + 'static;

    /// Minimum engine version the source of truth requires, if any.
    fn min_version(&self) -> Option<Version>;

    /// All target names managed by the source of truth.
    ///
    /// # Errors
    ///
    /// - Return [`Self::Error`] if the source of truth cannot be read.
    fn target_names(&self) -> Result<Vec<String>, Self::Error>;

    /// Target state of target name `name`.
    ///
    /// # Errors
    ///
    /// - Return [`Self::Error`] if `name` is unknown, or its target state
    ///   cannot be produced.
    fn target_state(&self, name: &str) -> Result<TargetStateEntry, Self::Error>;
}

/// Umask of [`ApplyOptions::default`].
pub const DEFAULT_UMASK: u32 = 0o022;

/// Per-run apply options.
///
/// The default umask is [`DEFAULT_UMASK`]. Callers wanting the umask of the
/// process should read it once with [`process_umask`] before any threads are
/// spawned.
///
/// [`process_umask`]: crate::entry::target::process_umask
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ApplyOptions {
    /// Entry types to operate on.
    pub include: IncludeSet,

    /// Permission bits to clear when creating and comparing entries.
    pub umask: u32,

    /// Check that each target converged after it was applied.
    pub verify: bool,

    /// Run scripts again even if they already ran.
    pub force_scripts: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            include: IncludeSet::ALL,
            umask: DEFAULT_UMASK,
            verify: false,
            force_scripts: false,
        }
    }
}

/// Outcome of applying one target name.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
    /// Destination was changed.
    Applied,

    /// Nothing needed to be done, or the target was filtered out.
    Skipped,
}

/// Outcome of applying many target names.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Summary {
    /// Target names that changed the destination.
    pub applied: Vec<String>,

    /// Target names that needed nothing.
    pub skipped: Vec<String>,

    /// Target names that failed while keeping going.
    pub failed: Vec<String>,
}

impl Summary {
    /// Check if every target name succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Display for Summary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{} applied, {} skipped, {} failed",
            self.applied.len(),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

/// Dotted `major.minor.patch` engine version.
///
/// Missing components count as zero, and pre-release or build suffixes are
/// ignored.
#[derive(Default, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Version of the running engine.
    pub fn current() -> Self {
        env!("CARGO_PKG_VERSION").parse().unwrap_or_default()
    }
}

impl FromStr for Version {
    type Err = ApplyError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let invalid = || ApplyError::InvalidVersion {
            version: data.to_string(),
        };

        let core = data
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let mut parts = [0; 3];
        let mut count = 0;
        for part in core.split('.') {
            let slot = parts.get_mut(count).ok_or_else(invalid)?;
            *slot = part.parse().map_err(|_| invalid())?;
            count += 1;
        }

        let [major, minor, patch] = parts;
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl Display for Version {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for Version {
    type Error = ApplyError;

    fn try_from(data: String) -> Result<Self, Self::Error> {
        data.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

/// Drive target state from a resolver into a destination.
#[derive(Debug)]
pub struct Reconciler<R> {
    resolver: R,
    keep_going: bool,
}

impl<R> Reconciler<R>
where
    R: Resolver,
{
    /// Construct new reconciler over `resolver`.
    ///
    /// # Errors
    ///
    /// - Return [`ApplyError::VersionMismatch`] if `resolver` requires a newer
    ///   engine than the running one.
    pub fn new(resolver: R) -> Result<Self> {
        if let Some(required) = resolver.min_version() {
            let current = Version::current();
            if required > current {
                return Err(ApplyError::VersionMismatch { required, current });
            }
        }

        Ok(Self {
            resolver,
            keep_going: false,
        })
    }

    /// Log failures and continue with the next target name instead of
    /// aborting.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// All managed target names, sorted and without duplicates.
    ///
    /// # Errors
    ///
    /// - Return [`ApplyError::Resolve`] if the resolver fails.
    pub fn target_names(&self) -> Result<Vec<String>> {
        let names = self.resolver.target_names().map_err(resolve_error)?;
        Ok(sorted(names))
    }

    /// Apply target name `name` below `dest_dir`.
    ///
    /// # Errors
    ///
    /// - Return [`ApplyError::Resolve`] if the target state cannot be
    ///   resolved.
    /// - Return [`ApplyError::Entry`] if inspecting or applying the entry
    ///   fails.
    /// - Return [`ApplyError::Unconverged`] if verification is requested, and
    ///   the entry still differs from its target after the apply.
    /// - Return [`ApplyError::PersistentState`] if the entry state cannot be
    ///   persisted.
    #[instrument(skip(self, system, dest_dir, options), level = "debug")]
    pub fn apply_one<S>(
        &self,
        system: &S,
        dest_dir: &Path,
        name: &str,
        options: &ApplyOptions,
    ) -> Result<Status>
    where
        S: System + ?Sized,
    {
        let target = self.resolver.target_state(name).map_err(resolve_error)?;
        if !options.include.includes(&target) {
            debug!("excluded by include filter");
            return Ok(Status::Skipped);
        }

        if options.force_scripts {
            target.forget_script(system)?;
        }

        let path = dest_dir.join(name);
        let actual = ActualStateEntry::new(system, &path)?;
        let changed = target.apply(system, &actual, options.umask)?;

        if options.verify && !target.is_script() {
            let actual = ActualStateEntry::new(system, &path)?;
            if !target.equal(&actual, options.umask)? {
                return Err(ApplyError::Unconverged {
                    name: name.to_string(),
                });
            }
        }

        persist_entry_state(system, name, &target, options.umask)?;

        if changed {
            info!("applied {name}");
            Ok(Status::Applied)
        } else {
            debug!("nothing to do");
            Ok(Status::Skipped)
        }
    }

    /// Apply every managed target name below `dest_dir`.
    ///
    /// # Errors
    ///
    /// - Return [`ApplyError::Resolve`] if the target names cannot be listed.
    /// - Return the first failure of [`Reconciler::apply_one`] unless keeping
    ///   going.
    pub fn apply_all<S>(&self, system: &S, dest_dir: &Path, options: &ApplyOptions) -> Result<Summary>
    where
        S: System + ?Sized,
    {
        let names = self.target_names()?;
        self.apply_names(system, dest_dir, names, options)
    }

    /// Apply selected target names below `dest_dir`.
    ///
    /// # Errors
    ///
    /// - Return the first failure of [`Reconciler::apply_one`] unless keeping
    ///   going.
    pub fn apply_names<S>(
        &self,
        system: &S,
        dest_dir: &Path,
        names: impl IntoIterator<Item = impl Into<String>>,
        options: &ApplyOptions,
    ) -> Result<Summary>
    where
        S: System + ?Sized,
    {
        let mut summary = Summary::default();
        for name in sorted(names.into_iter().map(Into::into).collect()) {
            match self.apply_one(system, dest_dir, &name, options) {
                Ok(Status::Applied) => summary.applied.push(name),
                Ok(Status::Skipped) => summary.skipped.push(name),
                Err(err) if self.keep_going => {
                    error!("{name}: {err}");
                    summary.failed.push(name);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(summary)
    }

    /// List managed target names whose destination differs from their target.
    ///
    /// Scripts differ until they have run once.
    ///
    /// # Errors
    ///
    /// - Return [`ApplyError::Resolve`] if target state cannot be resolved.
    /// - Return [`ApplyError::Entry`] if an entry cannot be inspected.
    pub fn verify_all<S>(&self, system: &S, dest_dir: &Path, options: &ApplyOptions) -> Result<Vec<String>>
    where
        S: System + ?Sized,
    {
        let mut differ = Vec::new();
        for name in self.target_names()? {
            let target = self.resolver.target_state(&name).map_err(resolve_error)?;
            if !options.include.includes(&target) {
                continue;
            }

            let equal = if target.is_script() {
                !target.script_pending(system)?
            } else {
                let actual = ActualStateEntry::new(system, dest_dir.join(&name))?;
                target.equal(&actual, options.umask)?
            };

            if !equal {
                debug!("{name} differs from target");
                differ.push(name);
            }
        }

        Ok(differ)
    }
}

fn persist_entry_state<S>(system: &S, name: &str, target: &TargetStateEntry, umask: u32) -> Result<()>
where
    S: System + ?Sized,
{
    let state = system.persistent_state();
    let key = name.as_bytes();
    let stored = state.get(ENTRY_STATE_BUCKET, key)?;

    match target.entry_state(umask)? {
        Some(entry_state) => {
            let value = entry_state.to_json()?;
            // INVARIANT: Converged targets never write to the store.
            if stored.as_deref() != Some(value.as_slice()) {
                state.set(ENTRY_STATE_BUCKET, key, &value)?;
            }
        }
        None if !target.is_script() && stored.is_some() => {
            state.delete(ENTRY_STATE_BUCKET, key)?;
        }
        None => {}
    }

    Ok(())
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

fn resolve_error(error: impl StdError + Send + Sync + 'static) -> ApplyError {
    ApplyError::Resolve(Box::new(error))
}

/// Apply error types.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Source of truth requires a newer engine.
    #[error("source state requires version {required} or later, this is version {current}")]
    VersionMismatch { required: Version, current: Version },

    /// Version string is not dotted numbers.
    #[error("invalid version {version:?}")]
    InvalidVersion { version: String },

    /// Entry still differs from its target after being applied.
    #[error("{name}: did not converge to target state")]
    Unconverged { name: String },

    /// Resolver fails to produce target state.
    #[error("failed to resolve target state")]
    Resolve(#[source] Box<dyn StdError + Send + Sync>),

    /// Entry cannot be inspected or applied.
    #[error(transparent)]
    Entry(#[from] EntryError),

    /// Persistent state access fails.
    #[error(transparent)]
    PersistentState(#[from] StoreError),

    /// Entry state cannot be encoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Friendly result alias :3
pub type Result<T, E = ApplyError> = std::result::Result<T, E>;
