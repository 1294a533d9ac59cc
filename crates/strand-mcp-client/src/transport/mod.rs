//! Transport implementations for the MCP client.

pub mod stdio;

pub use stdio::{StdioServerParameters, StdioTransport};
