// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::path::PathBuf;

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/oxistate/oxistate.toml` as
/// the default. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("oxistate").join("oxistate.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to persistent state file.
///
/// Lives beside the default configuration file as `oxistate.db`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_state_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("oxistate").join("oxistate.db"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to manifest file.
///
/// Lives beside the default configuration file as `manifest.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_manifest_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("oxistate").join("manifest.toml"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[cfg(target_os = "linux")]
    #[sealed_test(env = [("XDG_CONFIG_HOME", "/home/blah/.config")])]
    fn default_files_follow_xdg_config_home() -> anyhow::Result<()> {
        assert_eq!(
            default_config_file()?,
            PathBuf::from("/home/blah/.config/oxistate/oxistate.toml")
        );
        assert_eq!(
            default_state_file()?,
            PathBuf::from("/home/blah/.config/oxistate/oxistate.db")
        );
        assert_eq!(
            default_manifest_file()?,
            PathBuf::from("/home/blah/.config/oxistate/manifest.toml")
        );

        Ok(())
    }
}
