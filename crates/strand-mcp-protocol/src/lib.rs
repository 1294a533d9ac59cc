//! # MCP Protocol Types
//!
//! Wire-level types for the Model Context Protocol: the JSON-RPC 2.0 message
//! variants every transport carries, and the feature payloads the session
//! dispatchers route (initialize, tools, resources, prompts, roots, sampling).
//!
//! This crate is transport-agnostic and runtime-agnostic; it only depends on
//! serde. The session and facade crates build on top of it.

pub mod content;
pub mod initialize;
pub mod jsonrpc;
pub mod meta;
pub mod prompts;
pub mod resources;
pub mod roots;
pub mod sampling;
pub mod tools;
pub mod version;

// Re-export the types callers touch most often
pub use content::{Content, Role};
pub use initialize::{
    ClientCapabilities, Implementation, InitializeRequest, InitializeResult, LoggingCapabilities,
    PromptsCapabilities, ResourcesCapabilities, RootsCapabilities, SamplingCapabilities,
    ServerCapabilities, ToolsCapabilities,
};
pub use jsonrpc::{
    ClassifyError, JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use meta::{Cursor, PaginatedRequest};
pub use prompts::{GetPromptRequest, GetPromptResult, ListPromptsResult, Prompt, PromptArgument, PromptMessage};
pub use resources::{
    ListResourceTemplatesResult, ListResourcesResult, ReadResourceRequest, ReadResourceResult,
    Resource, ResourceContents, ResourceTemplate, SubscribeRequest, UnsubscribeRequest,
};
pub use roots::{ListRootsResult, Root};
pub use sampling::{
    CreateMessageRequest, CreateMessageResult, IncludeContext, ModelHint, ModelPreferences,
    SamplingMessage, StopReason,
};
pub use tools::{CallToolRequest, CallToolResult, ListToolsResult, Tool};
pub use version::ProtocolVersion;

/// Wire method names, as a single point of truth for both facades and tests.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";

    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";

    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";

    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";

    pub const ROOTS_LIST: &str = "roots/list";

    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";

    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFICATION_ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
}
