//! Pagination primitives shared by the `*/list` operations.

use serde::{Deserialize, Serialize};

/// An opaque pagination cursor returned by a previous list result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Parameters for the paginated list requests (`tools/list`, `resources/list`,
/// `prompts/list`, `resources/templates/list`, `roots/list`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl PaginatedRequest {
    pub fn new(cursor: Option<Cursor>) -> Self {
        Self { cursor }
    }
}
