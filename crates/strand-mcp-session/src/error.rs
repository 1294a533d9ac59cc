//! Error types for the session layer.

use serde_json::Value;
use thiserror::Error;

use strand_mcp_protocol::jsonrpc::error_codes;
use strand_mcp_protocol::JsonRpcErrorObject;

/// Result type for session operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors surfaced by session operations and handlers.
#[derive(Debug, Error)]
pub enum McpError {
    /// I/O failure on the underlying pipe. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A well-formed error response from the peer.
    #[error("peer returned error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The per-request deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The caller or a session close cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The peer answered `initialize` with an unexpected protocol version.
    #[error("unsupported protocol version from peer: {actual} (expected {expected})")]
    VersionMismatch { expected: String, actual: String },

    /// No handler is registered for the inbound method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Invalid construction, detected before any I/O happens.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation requires a completed `initialize` handshake.
    #[error("session not initialized")]
    NotInitialized,

    /// The `initialize` handshake already ran on this session.
    #[error("session already initialized")]
    AlreadyInitialized,

    /// The session is closing or closed.
    #[error("session closed")]
    Closed,

    /// Payload (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    pub fn config(message: impl Into<String>) -> Self {
        McpError::Config(message.into())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        McpError::Protocol {
            code: error_codes::INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    /// Convert a handler failure into the error object sent back on the wire.
    ///
    /// Decode failures map to invalid params, missing handlers to method not
    /// found, protocol errors pass their own code through, and everything
    /// else is an internal error.
    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        match self {
            McpError::MethodNotFound(method) => JsonRpcErrorObject::method_not_found(method),
            McpError::Json(err) => JsonRpcErrorObject::invalid_params(err.to_string()),
            McpError::Protocol { code, message, data } => {
                JsonRpcErrorObject::new(*code, message.clone(), data.clone())
            }
            other => JsonRpcErrorObject::internal_error(other.to_string()),
        }
    }
}

impl From<JsonRpcErrorObject> for McpError {
    fn from(error: JsonRpcErrorObject) -> Self {
        McpError::Protocol {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Errors raised by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}
