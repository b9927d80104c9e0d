// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Declarative file system state reconciliation.
//!
//! Oxistate takes a description of how a set of file system entries _should_
//! look, works out the smallest set of changes needed to make the file system
//! look that way, applies them, and remembers what it did so that running it
//! again is always safe.
//!
//! # Layers
//!
//! - [`store`]: bucketed key/value persistent state and its decorators.
//! - [`system`]: capability abstraction over every file system, process, and
//!   persistent state effect, and its decorators.
//! - [`entry`]: actual state, target state, and persisted entry state.
//! - [`apply`]: reconciliation of a destination against a [`Resolver`].
//! - [`manifest`]: TOML manifest acting as a [`Resolver`].
//!
//! [`Resolver`]: crate::apply::Resolver

pub mod apply;
pub mod config;
pub mod entry;
pub mod manifest;
pub mod path;
pub mod store;
pub mod system;
