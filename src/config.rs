// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that Oxistate uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.

use crate::{
    entry::target::IncludeSet,
    system::{Interpreter, Interpreters, SystemError},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Engine configuration layout.
///
/// # General Layout
///
/// A configuration is composed of two parts: settings and interpreters. The
/// settings section defines where and how target state is applied. The
/// interpreters section maps script file extensions to the command that
/// should run them, e.g., `[interpreters.py]` for Python scripts.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Settings for the engine.
    #[serde(default)]
    pub settings: Settings,

    /// Script interpreters keyed by file extension.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interpreters: BTreeMap<String, Interpreter>,
}

impl Config {
    /// Build script interpreter registry.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Interpreter`] if two entries name the same
    ///   extension, e.g., "py" and ".py".
    pub fn interpreters(&self) -> Result<Interpreters> {
        Ok(Interpreters::try_from_iter(
            self.interpreters
                .iter()
                .map(|(extension, interpreter)| (extension, interpreter.clone())),
        )?)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path fields.
        if let Some(dest_dir) = config.settings.dest_dir.take() {
            config.settings.dest_dir = Some(expand(&dest_dir)?);
        }
        if let Some(state_file) = config.settings.state_file.take() {
            config.settings.state_file = Some(expand(&state_file)?);
        }

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Engine settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Destination directory target names are relative to.
    ///
    /// Defaults to the user's home directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_dir: Option<PathBuf>,

    /// Permission bits to clear. Defaults to the umask of the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub umask: Option<Mode>,

    /// Continue with the next target name after a failure.
    #[serde(default)]
    pub keep_going: bool,

    /// Persistent state file. Defaults to a file beside the configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// Seconds to wait for the persistent state lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,

    /// Entry types to operate on.
    #[serde(default)]
    pub include: IncludeSet,
}

impl Settings {
    /// Lock timeout as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dest_dir: None,
            umask: None,
            keep_going: false,
            state_file: None,
            lock_timeout: default_lock_timeout(),
            include: IncludeSet::ALL,
        }
    }
}

fn default_lock_timeout() -> u64 {
    2
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Octal permission bits, written as a string like "644" or "0o644".
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mode(u32);

impl Mode {
    /// Construct new mode from raw permission bits.
    pub fn new(bits: u32) -> Self {
        Self(bits & 0o7777)
    }

    /// Get raw permission bits.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let digits = data.trim().trim_start_matches("0o");
        match u32::from_str_radix(digits, 8) {
            Ok(bits) if bits <= 0o7777 => Ok(Self(bits)),
            _ => Err(ConfigError::InvalidMode {
                value: data.to_string(),
            }),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:03o}", self.0)
    }
}

impl TryFrom<String> for Mode {
    type Error = ConfigError;

    fn try_from(data: String) -> Result<Self, Self::Error> {
        data.parse()
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.to_string()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Permission bits are not an octal number.
    #[error("invalid mode {value:?}")]
    InvalidMode { value: String },

    /// Interpreter registry cannot be built.
    #[error(transparent)]
    Interpreter(#[from] SystemError),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[sealed_test(env = [("BLAH", "/home/blah/blah")])]
    fn deserialize_config() -> anyhow::Result<()> {
        let result: Config = r#"
            [settings]
            dest_dir = "$BLAH"
            umask = "077"
            keep_going = true
            state_file = "$BLAH/state.db"
            include = "files,dirs"

            [interpreters.py]
            command = "python3"
            args = ["-u"]
        "#
        .parse()?;

        let expect = Config {
            settings: Settings {
                dest_dir: Some("/home/blah/blah".into()),
                umask: Some(Mode::new(0o077)),
                keep_going: true,
                state_file: Some("/home/blah/blah/state.db".into()),
                lock_timeout: 2,
                include: IncludeSet::FILES.union(IncludeSet::DIRS),
            },
            interpreters: BTreeMap::from([(
                "py".to_string(),
                Interpreter {
                    command: "python3".into(),
                    args: vec!["-u".into()],
                },
            )]),
        };

        assert_eq!(result, expect);
        assert_eq!(result.settings.lock_timeout(), Duration::from_secs(2));

        Ok(())
    }

    #[test]
    fn serialize_config() {
        let result = Config {
            settings: Settings {
                dest_dir: Some("/home/blah/blah".into()),
                umask: Some(Mode::new(0o022)),
                ..Settings::default()
            },
            interpreters: BTreeMap::new(),
        }
        .to_string();

        let expect = indoc! {r#"
            [settings]
            dest_dir = "/home/blah/blah"
            umask = "022"
            keep_going = false
            lock_timeout = 2
            include = "all"
        "#};

        assert_eq!(result, expect);
    }

    #[test]
    fn empty_config_uses_defaults() -> anyhow::Result<()> {
        let result: Config = "".parse()?;
        assert_eq!(result, Config::default());
        assert!(result.interpreters()?.find("setup.py").is_none());

        Ok(())
    }

    #[test]
    fn duplicate_interpreter_extension() -> anyhow::Result<()> {
        let config: Config = r#"
            [interpreters.py]
            command = "python3"

            [interpreters.".py"]
            command = "python2"
        "#
        .parse()?;

        assert!(matches!(
            config.interpreters(),
            Err(ConfigError::Interpreter(SystemError::DuplicateInterpreter { .. }))
        ));

        Ok(())
    }

    #[test_case("644", 0o644; "plain")]
    #[test_case("0o755", 0o755; "prefixed")]
    #[test_case("022", 0o022; "leading zero")]
    #[test]
    fn parse_mode(data: &str, expect: u32) -> anyhow::Result<()> {
        pretty_assertions::assert_eq!(data.parse::<Mode>()?.bits(), expect);
        Ok(())
    }

    #[test_case("rw-r--r--"; "symbolic")]
    #[test_case("888"; "not octal")]
    #[test_case("77777"; "too large")]
    #[test]
    fn reject_invalid_mode(data: &str) {
        assert!(matches!(data.parse::<Mode>(), Err(ConfigError::InvalidMode { .. })));
    }
}
