// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Persisted entry fingerprints.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Mode bit marking a directory in persisted entry state.
pub const MODE_DIR: u32 = 1 << 31;

/// Mode bit marking a symbolic link in persisted entry state.
pub const MODE_SYMLINK: u32 = 1 << 27;

/// Fingerprint of the last successful apply of a target.
///
/// Stored as JSON in the entry state bucket, keyed by target name:
///
/// ```json
/// {"mode":134217728,"contentsSHA256":"00010203"}
/// ```
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct EntryState {
    /// Type and permission bits.
    pub mode: u32,

    /// SHA-256 of the contents, empty if the entry has none.
    #[serde(
        rename = "contentsSHA256",
        default,
        serialize_with = "to_hex",
        deserialize_with = "from_hex"
    )]
    pub contents_sha256: Vec<u8>,
}

impl EntryState {
    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// - Return [`serde_json::Error`] if encoding fails.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// - Return [`serde_json::Error`] if `data` is not valid entry state.
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

fn to_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

fn from_hex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let data = String::deserialize(deserializer)?;
    hex::decode(data).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn symlink_entry_state_json() -> anyhow::Result<()> {
        let state = EntryState {
            mode: MODE_SYMLINK,
            contents_sha256: vec![0, 1, 2, 3],
        };

        let data = state.to_json()?;
        assert_eq!(
            String::from_utf8(data.clone())?,
            r#"{"mode":134217728,"contentsSHA256":"00010203"}"#
        );
        assert_eq!(EntryState::from_json(&data)?, state);

        Ok(())
    }

    #[test]
    fn rejects_bad_hash() {
        let result = EntryState::from_json(br#"{"mode":420,"contentsSHA256":"xyz"}"#);
        assert!(result.is_err());
    }
}
