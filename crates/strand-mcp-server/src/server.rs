//! The MCP server facade: feature registries dispatched over a session.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info};

use strand_mcp_protocol::{
    methods, CallToolRequest, CallToolResult, ClientCapabilities, CreateMessageRequest,
    CreateMessageResult, GetPromptRequest, GetPromptResult, Implementation, InitializeRequest,
    InitializeResult, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListRootsResult, ListToolsResult, Prompt, ProtocolVersion, ReadResourceRequest,
    ReadResourceResult, Resource, ResourceTemplate, Root, ServerCapabilities, SubscribeRequest,
    Tool, UnsubscribeRequest,
};
use strand_mcp_session::{
    notification_handler, request_handler, McpError, McpResult, NotificationHandlerMap,
    RequestHandlerMap, Session, SessionConfig, SessionState, Transport,
};

/// Executes one `tools/call` for a registered tool.
pub type ToolHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, McpResult<CallToolResult>> + Send + Sync>;
/// Produces the contents of a registered resource.
pub type ResourceReader = Arc<
    dyn Fn(ReadResourceRequest) -> BoxFuture<'static, McpResult<ReadResourceResult>> + Send + Sync,
>;
/// Renders a registered prompt.
pub type PromptProvider =
    Arc<dyn Fn(GetPromptRequest) -> BoxFuture<'static, McpResult<GetPromptResult>> + Send + Sync>;
/// Invoked with the client's full root list after a roots change refresh.
pub type RootsChangeConsumer =
    Arc<dyn Fn(Vec<Root>) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

#[derive(Clone)]
struct RegisteredTool {
    tool: Tool,
    handler: ToolHandler,
}

#[derive(Clone)]
struct RegisteredResource {
    resource: Resource,
    reader: ResourceReader,
}

#[derive(Clone)]
struct RegisteredPrompt {
    prompt: Prompt,
    provider: PromptProvider,
}

/// Builder for [`McpServer`]. Declared capabilities follow the registries:
/// registering at least one tool declares the tools capability, and so on.
pub struct McpServerBuilder {
    server_info: Implementation,
    instructions: Option<String>,
    request_timeout: Duration,
    tools: Vec<RegisteredTool>,
    resources: Vec<RegisteredResource>,
    resource_templates: Vec<ResourceTemplate>,
    prompts: Vec<RegisteredPrompt>,
    roots_consumers: Vec<RootsChangeConsumer>,
}

impl Default for McpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl McpServerBuilder {
    pub fn new() -> Self {
        Self {
            server_info: Implementation::new("strand-mcp-server", env!("CARGO_PKG_VERSION")),
            instructions: None,
            request_timeout: Duration::from_secs(30),
            tools: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
            prompts: Vec::new(),
            roots_consumers: Vec::new(),
        }
    }

    pub fn server_info(mut self, info: Implementation) -> Self {
        self.server_info = info;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn tool<F, Fut>(mut self, tool: Tool, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<CallToolResult>> + Send + 'static,
    {
        self.tools.push(RegisteredTool {
            tool,
            handler: Arc::new(move |arguments| Box::pin(handler(arguments))),
        });
        self
    }

    pub fn resource<F, Fut>(mut self, resource: Resource, reader: F) -> Self
    where
        F: Fn(ReadResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<ReadResourceResult>> + Send + 'static,
    {
        self.resources.push(RegisteredResource {
            resource,
            reader: Arc::new(move |request| Box::pin(reader(request))),
        });
        self
    }

    pub fn resource_template(mut self, template: ResourceTemplate) -> Self {
        self.resource_templates.push(template);
        self
    }

    pub fn prompt<F, Fut>(mut self, prompt: Prompt, provider: F) -> Self
    where
        F: Fn(GetPromptRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<GetPromptResult>> + Send + 'static,
    {
        self.prompts.push(RegisteredPrompt {
            prompt,
            provider: Arc::new(move |request| Box::pin(provider(request))),
        });
        self
    }

    pub fn roots_change_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Root>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.roots_consumers
            .push(Arc::new(move |roots| Box::pin(consumer(roots))));
        self
    }

    /// Bind the server to a started transport and install the standard
    /// handler set. Capabilities are derived from the registries.
    pub async fn connect<T>(self, transport: T) -> McpResult<McpServer>
    where
        T: Transport + 'static,
    {
        let mut capabilities = ServerCapabilities::default();
        if !self.tools.is_empty() {
            capabilities = capabilities.with_tools(true);
        }
        if !self.resources.is_empty() || !self.resource_templates.is_empty() {
            capabilities = capabilities.with_resources(true, true);
        }
        if !self.prompts.is_empty() {
            capabilities = capabilities.with_prompts(true);
        }

        let inner = Arc::new(ServerInner {
            session: OnceLock::new(),
            capabilities,
            server_info: self.server_info,
            instructions: self.instructions,
            tools: self.tools,
            resources: self.resources,
            resource_templates: self.resource_templates,
            prompts: self.prompts,
            subscriptions: Mutex::new(HashSet::new()),
            client_state: Mutex::new(None),
            roots_consumers: self.roots_consumers,
            roots_refresh_inflight: AtomicBool::new(false),
        });

        let mut request_handlers = RequestHandlerMap::new();
        {
            let inner = Arc::clone(&inner);
            request_handlers.insert(
                methods::INITIALIZE.to_string(),
                request_handler(move |params| {
                    let inner = Arc::clone(&inner);
                    async move { inner.handle_initialize(params) }
                }),
            );
        }
        request_handlers.insert(
            methods::PING.to_string(),
            request_handler(|_params| async move { Ok(json!({})) }),
        );
        if inner.capabilities.tools.is_some() {
            let listing = Arc::clone(&inner);
            request_handlers.insert(
                methods::TOOLS_LIST.to_string(),
                request_handler(move |_params| {
                    let inner = Arc::clone(&listing);
                    async move {
                        let tools: Vec<Tool> =
                            inner.tools.iter().map(|entry| entry.tool.clone()).collect();
                        Ok(serde_json::to_value(ListToolsResult {
                            tools,
                            next_cursor: None,
                        })?)
                    }
                }),
            );
            let calling = Arc::clone(&inner);
            request_handlers.insert(
                methods::TOOLS_CALL.to_string(),
                request_handler(move |params| {
                    let inner = Arc::clone(&calling);
                    async move {
                        let request: CallToolRequest =
                            serde_json::from_value(params.unwrap_or(Value::Null))?;
                        inner.handle_tool_call(request).await
                    }
                }),
            );
        }
        if inner.capabilities.resources.is_some() {
            let listing = Arc::clone(&inner);
            request_handlers.insert(
                methods::RESOURCES_LIST.to_string(),
                request_handler(move |_params| {
                    let inner = Arc::clone(&listing);
                    async move {
                        let resources: Vec<Resource> = inner
                            .resources
                            .iter()
                            .map(|entry| entry.resource.clone())
                            .collect();
                        Ok(serde_json::to_value(ListResourcesResult {
                            resources,
                            next_cursor: None,
                        })?)
                    }
                }),
            );
            let templates = Arc::clone(&inner);
            request_handlers.insert(
                methods::RESOURCES_TEMPLATES_LIST.to_string(),
                request_handler(move |_params| {
                    let inner = Arc::clone(&templates);
                    async move {
                        Ok(serde_json::to_value(ListResourceTemplatesResult {
                            resource_templates: inner.resource_templates.clone(),
                            next_cursor: None,
                        })?)
                    }
                }),
            );
            let reading = Arc::clone(&inner);
            request_handlers.insert(
                methods::RESOURCES_READ.to_string(),
                request_handler(move |params| {
                    let inner = Arc::clone(&reading);
                    async move {
                        let request: ReadResourceRequest =
                            serde_json::from_value(params.unwrap_or(Value::Null))?;
                        inner.handle_resource_read(request).await
                    }
                }),
            );
            let subscribing = Arc::clone(&inner);
            request_handlers.insert(
                methods::RESOURCES_SUBSCRIBE.to_string(),
                request_handler(move |params| {
                    let inner = Arc::clone(&subscribing);
                    async move {
                        let request: SubscribeRequest =
                            serde_json::from_value(params.unwrap_or(Value::Null))?;
                        inner.handle_subscribe(request)
                    }
                }),
            );
            let unsubscribing = Arc::clone(&inner);
            request_handlers.insert(
                methods::RESOURCES_UNSUBSCRIBE.to_string(),
                request_handler(move |params| {
                    let inner = Arc::clone(&unsubscribing);
                    async move {
                        let request: UnsubscribeRequest =
                            serde_json::from_value(params.unwrap_or(Value::Null))?;
                        inner.handle_unsubscribe(request)
                    }
                }),
            );
        }
        if inner.capabilities.prompts.is_some() {
            let listing = Arc::clone(&inner);
            request_handlers.insert(
                methods::PROMPTS_LIST.to_string(),
                request_handler(move |_params| {
                    let inner = Arc::clone(&listing);
                    async move {
                        let prompts: Vec<Prompt> = inner
                            .prompts
                            .iter()
                            .map(|entry| entry.prompt.clone())
                            .collect();
                        Ok(serde_json::to_value(ListPromptsResult {
                            prompts,
                            next_cursor: None,
                        })?)
                    }
                }),
            );
            let getting = Arc::clone(&inner);
            request_handlers.insert(
                methods::PROMPTS_GET.to_string(),
                request_handler(move |params| {
                    let inner = Arc::clone(&getting);
                    async move {
                        let request: GetPromptRequest =
                            serde_json::from_value(params.unwrap_or(Value::Null))?;
                        inner.handle_prompt_get(request).await
                    }
                }),
            );
        }

        let mut notification_handlers = NotificationHandlerMap::new();
        {
            let inner = Arc::clone(&inner);
            notification_handlers.insert(
                methods::NOTIFICATION_INITIALIZED.to_string(),
                notification_handler(move |_params| {
                    let inner = Arc::clone(&inner);
                    async move {
                        match inner.session.get() {
                            Some(session) => {
                                session.mark_initialized();
                                info!("client completed initialization");
                            }
                            None => debug!("initialized notification before session was available"),
                        }
                        Ok(())
                    }
                }),
            );
        }
        if !inner.roots_consumers.is_empty() {
            let inner = Arc::clone(&inner);
            notification_handlers.insert(
                methods::NOTIFICATION_ROOTS_LIST_CHANGED.to_string(),
                notification_handler(move |_params| {
                    let inner = Arc::clone(&inner);
                    async move {
                        ServerInner::refresh_roots(inner).await;
                        Ok(())
                    }
                }),
            );
        }

        let config = SessionConfig {
            request_timeout: self.request_timeout,
            ..Default::default()
        };
        let session =
            Session::connect(transport, config, request_handlers, notification_handlers).await?;
        let _ = inner.session.set(session.clone());

        Ok(McpServer { inner, session })
    }
}

/// The MCP server facade. Cheap to clone.
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
    session: Session,
}

struct ServerInner {
    session: OnceLock<Session>,
    capabilities: ServerCapabilities,
    server_info: Implementation,
    instructions: Option<String>,
    tools: Vec<RegisteredTool>,
    resources: Vec<RegisteredResource>,
    resource_templates: Vec<ResourceTemplate>,
    prompts: Vec<RegisteredPrompt>,
    subscriptions: Mutex<HashSet<String>>,
    client_state: Mutex<Option<(Implementation, ClientCapabilities)>>,
    roots_consumers: Vec<RootsChangeConsumer>,
    roots_refresh_inflight: AtomicBool,
}

impl McpServer {
    pub fn builder() -> McpServerBuilder {
        McpServerBuilder::new()
    }

    /// Whether the client completed the handshake.
    pub fn is_initialized(&self) -> bool {
        self.session.state() == SessionState::Initialized
    }

    /// Implementation info the client declared during initialization.
    pub fn client_info(&self) -> Option<Implementation> {
        self.inner
            .client_state
            .lock()
            .as_ref()
            .map(|(info, _)| info.clone())
    }

    /// Capabilities the client declared during initialization.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.inner
            .client_state
            .lock()
            .as_ref()
            .map(|(_, capabilities)| capabilities.clone())
    }

    /// Resource uris the client currently subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.inner.subscriptions.lock().iter().cloned().collect();
        uris.sort();
        uris
    }

    /// Ask the client for its root list (`roots/list`, server to client).
    pub async fn list_roots(&self) -> McpResult<ListRootsResult> {
        self.session.request(methods::ROOTS_LIST, Some(json!({}))).await
    }

    /// Ask the client's host LLM for a generation (`sampling/createMessage`,
    /// server to client). A client without the sampling capability answers
    /// with method-not-found, surfaced here as a protocol error.
    pub async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> McpResult<CreateMessageResult> {
        self.session
            .request(
                methods::SAMPLING_CREATE_MESSAGE,
                Some(serde_json::to_value(&request)?),
            )
            .await
    }

    pub async fn notify_tools_list_changed(&self) -> McpResult<()> {
        self.session
            .notify(methods::NOTIFICATION_TOOLS_LIST_CHANGED, None)
            .await
    }

    pub async fn notify_resources_list_changed(&self) -> McpResult<()> {
        self.session
            .notify(methods::NOTIFICATION_RESOURCES_LIST_CHANGED, None)
            .await
    }

    pub async fn notify_prompts_list_changed(&self) -> McpResult<()> {
        self.session
            .notify(methods::NOTIFICATION_PROMPTS_LIST_CHANGED, None)
            .await
    }

    pub async fn close_gracefully(&self) -> McpResult<()> {
        self.session.close_gracefully().await
    }

    pub fn close(&self) {
        self.session.close()
    }
}

impl ServerInner {
    fn handle_initialize(&self, params: Option<Value>) -> McpResult<Value> {
        let request: InitializeRequest = serde_json::from_value(params.unwrap_or(Value::Null))?;
        info!(
            client = %request.client_info.name,
            requested = %request.protocol_version,
            "initialize requested"
        );
        *self.client_state.lock() = Some((request.client_info, request.capabilities));

        // Echo a version we know; offer our latest otherwise.
        let negotiated = request
            .protocol_version
            .parse::<ProtocolVersion>()
            .unwrap_or(ProtocolVersion::LATEST);

        let mut result =
            InitializeResult::new(negotiated, self.capabilities.clone(), self.server_info.clone());
        if let Some(instructions) = &self.instructions {
            result = result.with_instructions(instructions.clone());
        }
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_tool_call(&self, request: CallToolRequest) -> McpResult<Value> {
        let Some(entry) = self.tools.iter().find(|entry| entry.tool.name == request.name) else {
            return Err(McpError::invalid_params(format!(
                "Unknown tool: {}",
                request.name
            )));
        };
        let result = (entry.handler)(request.arguments).await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_resource_read(&self, request: ReadResourceRequest) -> McpResult<Value> {
        let Some(entry) = self
            .resources
            .iter()
            .find(|entry| entry.resource.uri == request.uri)
        else {
            return Err(McpError::invalid_params(format!(
                "Unknown resource: {}",
                request.uri
            )));
        };
        let result = (entry.reader)(request).await?;
        Ok(serde_json::to_value(result)?)
    }

    fn handle_subscribe(&self, request: SubscribeRequest) -> McpResult<Value> {
        if !self
            .resources
            .iter()
            .any(|entry| entry.resource.uri == request.uri)
        {
            return Err(McpError::invalid_params(format!(
                "Unknown resource: {}",
                request.uri
            )));
        }
        self.subscriptions.lock().insert(request.uri);
        Ok(json!({}))
    }

    fn handle_unsubscribe(&self, request: UnsubscribeRequest) -> McpResult<Value> {
        if !self.subscriptions.lock().remove(&request.uri) {
            return Err(McpError::invalid_params(format!(
                "No subscription for resource: {}",
                request.uri
            )));
        }
        Ok(json!({}))
    }

    async fn handle_prompt_get(&self, request: GetPromptRequest) -> McpResult<Value> {
        let Some(entry) = self
            .prompts
            .iter()
            .find(|entry| entry.prompt.name == request.name)
        else {
            return Err(McpError::invalid_params(format!(
                "Unknown prompt: {}",
                request.name
            )));
        };
        let result = (entry.provider)(request).await?;
        Ok(serde_json::to_value(result)?)
    }

    /// Re-list the client's roots and fan out to consumers; bursts coalesce.
    async fn refresh_roots(inner: Arc<ServerInner>) {
        let Some(session) = inner.session.get() else {
            debug!("roots change notification before session was available");
            return;
        };
        if inner.roots_refresh_inflight.swap(true, Ordering::SeqCst) {
            debug!("roots refresh already in flight, coalescing");
            return;
        }
        let result = session
            .request::<ListRootsResult>(methods::ROOTS_LIST, Some(json!({})))
            .await;
        inner.roots_refresh_inflight.store(false, Ordering::SeqCst);
        match result {
            Ok(list) => {
                for consumer in &inner.roots_consumers {
                    if let Err(err) = consumer(list.roots.clone()).await {
                        error!(error = %err, "roots change consumer failed");
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to refresh roots after list change"),
        }
    }
}
