//! Identifier namespacing one upgrade attempt.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque 64-bit identifier rendered as 16 lowercase hex digits.
///
/// Temporary and archived directory names embed it so that repeated
/// attempts never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct UpgradeId(u64);

impl UpgradeId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for UpgradeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(
            s.len() == 16,
            "upgrade id must be 16 hex digits, got {s:?}"
        );
        let raw = u64::from_str_radix(s, 16)
            .map_err(|err| anyhow::anyhow!("invalid upgrade id {s:?}: {err}"))?;
        Ok(Self(raw))
    }
}

impl From<UpgradeId> for String {
    fn from(id: UpgradeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for UpgradeId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
