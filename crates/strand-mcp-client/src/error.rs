//! Error types for MCP client operations.

use thiserror::Error;

use strand_mcp_session::McpError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client facade.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Session-level failure (transport, protocol, timeout, cancellation,
    /// state, configuration).
    #[error(transparent)]
    Session(#[from] McpError),

    /// The client was not constructed with the capability the operation
    /// requires.
    #[error("client not configured with the {0} capability")]
    CapabilityMissing(&'static str),

    /// `add_root` was called with a uri already present.
    #[error("root with uri '{0}' already exists")]
    RootExists(String),

    /// `remove_root` was called with a uri that is not present.
    #[error("root with uri '{0}' not found")]
    RootNotFound(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Session(McpError::Json(err))
    }
}
