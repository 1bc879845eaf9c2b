// ── Core identity types ──
//
// LineId keys every per-line structure in the engine. EndpointId is the
// provider-side handle that a reprovisioning replaces. BindingInfo is the
// hardware binding a new endpoint is created against.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── LineId ──────────────────────────────────────────────────────────

/// SIM number / ICCID identifying a line, normalized to uppercase with
/// separators and whitespace removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineId(String);

impl LineId {
    /// Create a normalized line id from any common SIM number format.
    /// Accepts spaces and dashes as digit-group separators.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let normalized: String = raw
            .as_ref()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect::<String>()
            .to_uppercase();
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LineId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for LineId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── EndpointId ──────────────────────────────────────────────────────

/// Provider-side identity handle of a provisioned line instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ── BindingInfo ─────────────────────────────────────────────────────

/// Hardware binding of a line: the SIM (ICCID) and, when known, the
/// device (IMEI) it is locked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingInfo {
    pub iccid: String,
    pub imei: Option<String>,
}
