//! # MCP Client
//!
//! A Model Context Protocol client over the `strand-mcp-session` layer:
//! typed feature operations (tools, resources, prompts), client-side feature
//! state (roots, sampling), change-notification fan-out, and the stdio
//! child-process transport.
//!
//! ```rust,no_run
//! use strand_mcp_client::{McpClient, StdioServerParameters, StdioTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = StdioServerParameters::new("uvx").with_args(["mcp-server-git"]);
//!     let client = McpClient::builder()
//!         .connect(StdioTransport::new(params))
//!         .await?;
//!
//!     client.initialize().await?;
//!     let tools = client.list_tools(None).await?;
//!     println!("server exposes {} tools", tools.tools.len());
//!
//!     client.close_gracefully().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod transport;

pub use client::{
    McpClient, McpClientBuilder, PromptsChangeConsumer, ResourcesChangeConsumer, SamplingHandler,
    ToolsChangeConsumer,
};
pub use error::{ClientError, ClientResult};
pub use transport::{StdioServerParameters, StdioTransport};

// Re-export the layers below for callers that need them directly.
pub use strand_mcp_protocol as protocol;
pub use strand_mcp_session::{McpError, Session, SessionConfig, SessionState, Transport};
