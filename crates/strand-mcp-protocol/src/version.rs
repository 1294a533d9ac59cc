//! MCP protocol version support.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported MCP protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Original protocol with HTTP+SSE transport (introduced 2024-11-05)
    #[serde(rename = "2024-11-05")]
    V2024_11_05,
    /// Protocol including streamable HTTP (introduced 2025-03-26)
    #[serde(rename = "2025-03-26")]
    V2025_03_26,
}

/// Error raised when a peer advertises a version string this crate does not know.
#[derive(Debug, Clone, Error)]
#[error("unknown protocol version: {0}")]
pub struct UnknownVersion(pub String);

impl ProtocolVersion {
    /// The latest protocol version implemented by this workspace.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V2025_03_26;

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V2024_11_05 => "2024-11-05",
            ProtocolVersion::V2025_03_26 => "2025-03-26",
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = UnknownVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2024-11-05" => Ok(ProtocolVersion::V2024_11_05),
            "2025-03-26" => Ok(ProtocolVersion::V2025_03_26),
            other => Err(UnknownVersion(other.to_string())),
        }
    }
}
