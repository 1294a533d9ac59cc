//! # MCP Server
//!
//! A Model Context Protocol server over the `strand-mcp-session` layer:
//! tool/resource/prompt registries dispatched through the standard handler
//! set, server-to-client operations (roots introspection, sampling), and the
//! HTTP+SSE server transport.
//!
//! ```rust,no_run
//! use serde_json::json;
//! use strand_mcp_protocol::{CallToolResult, Tool};
//! use strand_mcp_server::{McpServer, SseServer, SseServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Each SSE peer gets its own McpServer; keep them alive here.
//!     let sessions = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
//!     let server = SseServer::bind(SseServerConfig::default(), move |transport| {
//!         let sessions = sessions.clone();
//!         async move {
//!             let connected = McpServer::builder()
//!                 .tool(
//!                     Tool::new("echo", json!({"type": "object"})),
//!                     |arguments| async move {
//!                         Ok(CallToolResult::text(format!("{:?}", arguments)))
//!                     },
//!                 )
//!                 .connect(transport)
//!                 .await;
//!             match connected {
//!                 Ok(session) => sessions.lock().unwrap().push(session),
//!                 Err(err) => tracing::error!(error = %err, "failed to bind session"),
//!             }
//!         }
//!     })
//!     .await?;
//!
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod http;
pub mod server;
pub mod sse;

pub use http::{ConnectHandler, SseServer, SseServerConfig, SESSION_COOKIE};
pub use server::{
    McpServer, McpServerBuilder, PromptProvider, ResourceReader, RootsChangeConsumer, ToolHandler,
};
pub use sse::SseServerTransport;

// Re-export the layers below for callers that need them directly.
pub use strand_mcp_protocol as protocol;
pub use strand_mcp_session::{McpError, Session, SessionConfig, SessionState, Transport};
