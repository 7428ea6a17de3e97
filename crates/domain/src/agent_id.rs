//! Agent identifiers.
//!
//! Every agent id doubles as a workspace directory name on the device, so
//! the format is validated at every boundary that maps an id to a path.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Prefix carried by every agent id.
pub const AGENT_ID_PREFIX: &str = "agent_";

/// Suffix alphabet (URL- and path-safe).
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

const MIN_SUFFIX_LEN: usize = 8;
const MAX_SUFFIX_LEN: usize = 24;
const GENERATED_SUFFIX_LEN: usize = 12;

/// A validated agent identifier: `agent_` followed by 8–24 characters of
/// `[A-Za-z0-9_-]`. Never contains `/` or `..`, so joining it onto a
/// workspace root cannot escape the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Generate a fresh random agent id.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let suffix: String = (0..GENERATED_SUFFIX_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(format!("{AGENT_ID_PREFIX}{suffix}"))
    }

    /// Parse and validate an agent id from untrusted input.
    pub fn parse(raw: &str) -> Result<Self> {
        let suffix = raw
            .strip_prefix(AGENT_ID_PREFIX)
            .ok_or_else(|| Error::InvalidAgentId(format!("missing {AGENT_ID_PREFIX} prefix")))?;
        if suffix.len() < MIN_SUFFIX_LEN || suffix.len() > MAX_SUFFIX_LEN {
            return Err(Error::InvalidAgentId(format!(
                "suffix length {} outside {MIN_SUFFIX_LEN}..={MAX_SUFFIX_LEN}",
                suffix.len()
            )));
        }
        if let Some(bad) = suffix
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(Error::InvalidAgentId(format!("illegal character {bad:?}")));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
