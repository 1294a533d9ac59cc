//! # MCP Session Layer
//!
//! The stateful core of an MCP runtime: a bidirectional JSON-RPC 2.0 session
//! over a pluggable [`Transport`]. The session mints request ids, correlates
//! responses, applies per-request deadlines, routes inbound requests and
//! notifications to handlers installed at construction, and orchestrates
//! graceful shutdown.
//!
//! Client and server facades (`strand-mcp-client`, `strand-mcp-server`) are
//! thin typed layers over [`Session::request`] / [`Session::notify`].

pub mod error;
pub mod handler;
pub mod session;
pub mod transport;

pub use error::{McpError, McpResult, TransportError};
pub use handler::{
    notification_handler, request_handler, NotificationHandler, NotificationHandlerMap,
    RequestHandler, RequestHandlerMap,
};
pub use session::{Session, SessionConfig, SessionState};
pub use transport::{InboundHandler, Transport};
