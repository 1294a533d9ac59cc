//! Types for the MCP roots feature.
//!
//! Roots are filesystem-or-URI boundaries the client advertises to the
//! server; servers query them with `roots/list` and hear about changes via
//! `notifications/roots/list_changed`.

use serde::{Deserialize, Serialize};

/// One root boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Root {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Result of `roots/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRootsResult {
    pub roots: Vec<Root>,
}

impl ListRootsResult {
    pub fn new(roots: Vec<Root>) -> Self {
        Self { roots }
    }
}
