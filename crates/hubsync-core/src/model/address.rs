// ── Core identity types ──
//
// DeviceId and SceneId are the stable identities every other entity is
// keyed by. Change replay resolves its targets through them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

// ── DeviceId ────────────────────────────────────────────────────────

/// Three-byte network address of a device, displayed as `AA.BB.CC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId([u8; 3]);

impl DeviceId {
    /// The all-zero address. Used by high-water-mark records.
    pub const ZERO: Self = Self([0, 0, 0]);

    pub const fn new(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> [u8; 3] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0, 0, 0]
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a:02X}.{b:02X}.{c:02X}")
    }
}

impl FromStr for DeviceId {
    type Err = CoreError;

    /// Accepts `AA.BB.CC`, `AA:BB:CC`, `AA-BB-CC` or bare `AABBCC`, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidAddress {
            input: s.to_owned(),
            reason: reason.to_owned(),
        };

        let hex: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '.' | ':' | '-'))
            .collect();
        if hex.len() != 6 {
            return Err(invalid("expected 6 hex digits"));
        }

        let mut bytes = [0u8; 3];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = hex.get(i * 2..i * 2 + 2).ok_or_else(|| invalid("truncated"))?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid("not hexadecimal"))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

// ── SceneId ─────────────────────────────────────────────────────────

/// Identity of a scene. Link records carry it to mark scene ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneId(u32);

impl SceneId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene#{}", self.0)
    }
}
