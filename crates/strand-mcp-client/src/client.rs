//! The MCP client: typed feature operations over a session.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info};

use strand_mcp_protocol::{
    methods, CallToolRequest, CallToolResult, ClientCapabilities, CreateMessageRequest,
    CreateMessageResult, Cursor, GetPromptRequest, GetPromptResult, Implementation,
    InitializeRequest, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListRootsResult, ListToolsResult, PaginatedRequest, Prompt,
    ProtocolVersion, ReadResourceRequest, ReadResourceResult, Resource, Root, ServerCapabilities,
    SubscribeRequest, Tool, UnsubscribeRequest,
};
use strand_mcp_session::{
    notification_handler, request_handler, McpError, McpResult, NotificationHandlerMap,
    RequestHandlerMap, Session, SessionConfig, Transport,
};

use crate::error::{ClientError, ClientResult};

/// Invoked with the full updated list after a `tools/list_changed` refresh.
pub type ToolsChangeConsumer =
    Arc<dyn Fn(Vec<Tool>) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;
/// Invoked with the full updated list after a `resources/list_changed` refresh.
pub type ResourcesChangeConsumer =
    Arc<dyn Fn(Vec<Resource>) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;
/// Invoked with the full updated list after a `prompts/list_changed` refresh.
pub type PromptsChangeConsumer =
    Arc<dyn Fn(Vec<Prompt>) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

/// Answers the server's `sampling/createMessage` requests with a generation
/// from the host LLM.
pub type SamplingHandler = Arc<
    dyn Fn(CreateMessageRequest) -> BoxFuture<'static, McpResult<CreateMessageResult>>
        + Send
        + Sync,
>;

/// Builder for [`McpClient`].
///
/// Capabilities may be declared explicitly; otherwise they are inferred:
/// supplying roots declares the roots capability and supplying a sampling
/// handler declares the sampling capability. Declaring sampling without a
/// handler fails fast at [`McpClientBuilder::connect`].
pub struct McpClientBuilder {
    request_timeout: Duration,
    client_info: Implementation,
    capabilities: Option<ClientCapabilities>,
    roots: Vec<Root>,
    tools_consumers: Vec<ToolsChangeConsumer>,
    resources_consumers: Vec<ResourcesChangeConsumer>,
    prompts_consumers: Vec<PromptsChangeConsumer>,
    sampling_handler: Option<SamplingHandler>,
}

impl Default for McpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClientBuilder {
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            client_info: Implementation::new("strand-mcp-client", env!("CARGO_PKG_VERSION")),
            capabilities: None,
            roots: Vec::new(),
            tools_consumers: Vec::new(),
            resources_consumers: Vec::new(),
            prompts_consumers: Vec::new(),
            sampling_handler: None,
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn client_info(mut self, info: Implementation) -> Self {
        self.client_info = info;
        self
    }

    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn root(mut self, root: Root) -> Self {
        self.roots.push(root);
        self
    }

    pub fn roots<I>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = Root>,
    {
        self.roots.extend(roots);
        self
    }

    pub fn tools_change_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Tool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.tools_consumers
            .push(Arc::new(move |tools| Box::pin(consumer(tools))));
        self
    }

    pub fn resources_change_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Resource>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.resources_consumers
            .push(Arc::new(move |resources| Box::pin(consumer(resources))));
        self
    }

    pub fn prompts_change_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Prompt>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.prompts_consumers
            .push(Arc::new(move |prompts| Box::pin(consumer(prompts))));
        self
    }

    pub fn sampling_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CreateMessageRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<CreateMessageResult>> + Send + 'static,
    {
        self.sampling_handler = Some(Arc::new(move |request| Box::pin(handler(request))));
        self
    }

    /// Bind the client to a started transport. The returned client is
    /// connected but not yet initialized; call [`McpClient::initialize`] to
    /// run the handshake.
    pub async fn connect<T>(self, transport: T) -> ClientResult<McpClient>
    where
        T: Transport + 'static,
    {
        let capabilities = match self.capabilities {
            Some(capabilities) => capabilities,
            None => {
                let mut capabilities = ClientCapabilities::default();
                if !self.roots.is_empty() {
                    capabilities = capabilities.with_roots(true);
                }
                if self.sampling_handler.is_some() {
                    capabilities = capabilities.with_sampling();
                }
                capabilities
            }
        };
        if capabilities.sampling.is_some() && self.sampling_handler.is_none() {
            return Err(McpError::config(
                "sampling capability declared without a sampling handler",
            )
            .into());
        }

        let roots: HashMap<String, Root> = self
            .roots
            .into_iter()
            .map(|root| (root.uri.clone(), root))
            .collect();

        let inner = Arc::new(ClientInner {
            session: OnceLock::new(),
            capabilities: capabilities.clone(),
            client_info: self.client_info,
            roots: Mutex::new(roots),
            init_result: Mutex::new(None),
            tools_consumers: self.tools_consumers,
            resources_consumers: self.resources_consumers,
            prompts_consumers: self.prompts_consumers,
            tools_refresh_inflight: AtomicBool::new(false),
            resources_refresh_inflight: AtomicBool::new(false),
            prompts_refresh_inflight: AtomicBool::new(false),
        });

        let mut request_handlers = RequestHandlerMap::new();
        request_handlers.insert(
            methods::PING.to_string(),
            request_handler(|_params| async move { Ok(json!({})) }),
        );
        if capabilities.roots.is_some() {
            let inner = Arc::clone(&inner);
            request_handlers.insert(
                methods::ROOTS_LIST.to_string(),
                request_handler(move |_params| {
                    let inner = Arc::clone(&inner);
                    async move {
                        let mut roots: Vec<Root> = inner.roots.lock().values().cloned().collect();
                        roots.sort_by(|a, b| a.uri.cmp(&b.uri));
                        Ok(serde_json::to_value(ListRootsResult::new(roots))?)
                    }
                }),
            );
        }
        if let (Some(_), Some(handler)) = (&capabilities.sampling, &self.sampling_handler) {
            let handler = Arc::clone(handler);
            request_handlers.insert(
                methods::SAMPLING_CREATE_MESSAGE.to_string(),
                request_handler(move |params| {
                    let handler = Arc::clone(&handler);
                    async move {
                        let request: CreateMessageRequest =
                            serde_json::from_value(params.unwrap_or(Value::Null))?;
                        let result = handler(request).await?;
                        Ok(serde_json::to_value(result)?)
                    }
                }),
            );
        }

        let mut notification_handlers = NotificationHandlerMap::new();
        {
            let inner = Arc::clone(&inner);
            notification_handlers.insert(
                methods::NOTIFICATION_TOOLS_LIST_CHANGED.to_string(),
                notification_handler(move |_params| {
                    let inner = Arc::clone(&inner);
                    async move {
                        ClientInner::refresh_tools(inner).await;
                        Ok(())
                    }
                }),
            );
        }
        {
            let inner = Arc::clone(&inner);
            notification_handlers.insert(
                methods::NOTIFICATION_RESOURCES_LIST_CHANGED.to_string(),
                notification_handler(move |_params| {
                    let inner = Arc::clone(&inner);
                    async move {
                        ClientInner::refresh_resources(inner).await;
                        Ok(())
                    }
                }),
            );
        }
        {
            let inner = Arc::clone(&inner);
            notification_handlers.insert(
                methods::NOTIFICATION_PROMPTS_LIST_CHANGED.to_string(),
                notification_handler(move |_params| {
                    let inner = Arc::clone(&inner);
                    async move {
                        ClientInner::refresh_prompts(inner).await;
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

        Ok(McpClient { inner, session })
    }
}

/// The MCP client facade. Cheap to clone.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
    session: Session,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient").finish_non_exhaustive()
    }
}

struct ClientInner {
    /// Set once right after the session starts; the change-notification
    /// handlers read it, and a notification racing construction is skipped.
    session: OnceLock<Session>,
    capabilities: ClientCapabilities,
    client_info: Implementation,
    roots: Mutex<HashMap<String, Root>>,
    init_result: Mutex<Option<InitializeResult>>,
    tools_consumers: Vec<ToolsChangeConsumer>,
    resources_consumers: Vec<ResourcesChangeConsumer>,
    prompts_consumers: Vec<PromptsChangeConsumer>,
    tools_refresh_inflight: AtomicBool,
    resources_refresh_inflight: AtomicBool,
    prompts_refresh_inflight: AtomicBool,
}

impl McpClient {
    pub fn builder() -> McpClientBuilder {
        McpClientBuilder::new()
    }

    /// Run the `initialize` handshake: version check, capability exchange,
    /// and the `notifications/initialized` acknowledgement.
    pub async fn initialize(&self) -> ClientResult<InitializeResult> {
        let request = InitializeRequest::new(
            ProtocolVersion::LATEST,
            self.inner.capabilities.clone(),
            self.inner.client_info.clone(),
        );
        let result: InitializeResult = self
            .session
            .request(methods::INITIALIZE, Some(serde_json::to_value(&request)?))
            .await?;

        if result.protocol_version != ProtocolVersion::LATEST.as_str() {
            return Err(McpError::VersionMismatch {
                expected: ProtocolVersion::LATEST.as_str().to_string(),
                actual: result.protocol_version.clone(),
            }
            .into());
        }

        self.session
            .notify(methods::NOTIFICATION_INITIALIZED, None)
            .await?;
        self.session.mark_initialized();

        info!(
            server = %result.server_info.name,
            version = %result.protocol_version,
            "session initialized"
        );
        *self.inner.init_result.lock() = Some(result.clone());
        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.init_result.lock().is_some()
    }

    /// Capabilities the server declared during initialization.
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner
            .init_result
            .lock()
            .as_ref()
            .map(|r| r.capabilities.clone())
    }

    /// Implementation info the server declared during initialization.
    pub fn server_info(&self) -> Option<Implementation> {
        self.inner
            .init_result
            .lock()
            .as_ref()
            .map(|r| r.server_info.clone())
    }

    pub async fn ping(&self) -> ClientResult<Value> {
        Ok(self.session.request(methods::PING, None).await?)
    }

    // --------------------------
    // Tools
    // --------------------------

    pub async fn list_tools(&self, cursor: Option<Cursor>) -> ClientResult<ListToolsResult> {
        Ok(self
            .session
            .request(methods::TOOLS_LIST, Some(paginated(cursor)?))
            .await?)
    }

    pub async fn call_tool(&self, request: CallToolRequest) -> ClientResult<CallToolResult> {
        Ok(self
            .session
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(&request)?))
            .await?)
    }

    // --------------------------
    // Resources
    // --------------------------

    pub async fn list_resources(
        &self,
        cursor: Option<Cursor>,
    ) -> ClientResult<ListResourcesResult> {
        Ok(self
            .session
            .request(methods::RESOURCES_LIST, Some(paginated(cursor)?))
            .await?)
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<Cursor>,
    ) -> ClientResult<ListResourceTemplatesResult> {
        Ok(self
            .session
            .request(methods::RESOURCES_TEMPLATES_LIST, Some(paginated(cursor)?))
            .await?)
    }

    pub async fn read_resource(
        &self,
        request: ReadResourceRequest,
    ) -> ClientResult<ReadResourceResult> {
        Ok(self
            .session
            .request(methods::RESOURCES_READ, Some(serde_json::to_value(&request)?))
            .await?)
    }

    pub async fn subscribe_resource(&self, request: SubscribeRequest) -> ClientResult<()> {
        let _: Value = self
            .session
            .request(
                methods::RESOURCES_SUBSCRIBE,
                Some(serde_json::to_value(&request)?),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, request: UnsubscribeRequest) -> ClientResult<()> {
        let _: Value = self
            .session
            .request(
                methods::RESOURCES_UNSUBSCRIBE,
                Some(serde_json::to_value(&request)?),
            )
            .await?;
        Ok(())
    }

    // --------------------------
    // Prompts
    // --------------------------

    pub async fn list_prompts(&self, cursor: Option<Cursor>) -> ClientResult<ListPromptsResult> {
        Ok(self
            .session
            .request(methods::PROMPTS_LIST, Some(paginated(cursor)?))
            .await?)
    }

    pub async fn get_prompt(&self, request: GetPromptRequest) -> ClientResult<GetPromptResult> {
        Ok(self
            .session
            .request(methods::PROMPTS_GET, Some(serde_json::to_value(&request)?))
            .await?)
    }

    // --------------------------
    // Roots
    // --------------------------

    /// Add a root. Sends `notifications/roots/list_changed` when the client
    /// declared `roots.listChanged`.
    pub async fn add_root(&self, root: Root) -> ClientResult<()> {
        let announce = self.roots_list_changed_declared()?;
        {
            let mut roots = self.inner.roots.lock();
            if roots.contains_key(&root.uri) {
                return Err(ClientError::RootExists(root.uri));
            }
            debug!(uri = %root.uri, "added root");
            roots.insert(root.uri.clone(), root);
        }
        if announce {
            self.roots_list_changed_notification().await?;
        }
        Ok(())
    }

    /// Remove a root by uri. Sends `notifications/roots/list_changed` when
    /// the client declared `roots.listChanged`.
    pub async fn remove_root(&self, uri: &str) -> ClientResult<()> {
        let announce = self.roots_list_changed_declared()?;
        {
            let mut roots = self.inner.roots.lock();
            if roots.remove(uri).is_none() {
                return Err(ClientError::RootNotFound(uri.to_string()));
            }
            debug!(uri = %uri, "removed root");
        }
        if announce {
            self.roots_list_changed_notification().await?;
        }
        Ok(())
    }

    /// Manually announce a roots change. `add_root`/`remove_root` send this
    /// automatically when the capability declares `listChanged`.
    pub async fn roots_list_changed_notification(&self) -> ClientResult<()> {
        Ok(self
            .session
            .notify(methods::NOTIFICATION_ROOTS_LIST_CHANGED, None)
            .await?)
    }

    fn roots_list_changed_declared(&self) -> ClientResult<bool> {
        let roots = self
            .inner
            .capabilities
            .roots
            .as_ref()
            .ok_or(ClientError::CapabilityMissing("roots"))?;
        Ok(roots.list_changed == Some(true))
    }

    // --------------------------
    // Lifecycle
    // --------------------------

    pub async fn close_gracefully(&self) -> ClientResult<()> {
        Ok(self.session.close_gracefully().await?)
    }

    pub fn close(&self) {
        self.session.close()
    }
}

impl ClientInner {
    /// Re-list tools and fan the result out to every consumer. At most one
    /// refresh is in flight; bursts of change notifications coalesce.
    async fn refresh_tools(inner: Arc<ClientInner>) {
        let Some(session) = inner.session.get() else {
            debug!("tools change notification before session was available");
            return;
        };
        if inner.tools_refresh_inflight.swap(true, Ordering::SeqCst) {
            debug!("tools refresh already in flight, coalescing");
            return;
        }
        let result = session
            .request::<ListToolsResult>(methods::TOOLS_LIST, Some(json!({})))
            .await;
        inner.tools_refresh_inflight.store(false, Ordering::SeqCst);
        match result {
            Ok(list) => {
                for consumer in &inner.tools_consumers {
                    if let Err(err) = consumer(list.tools.clone()).await {
                        error!(error = %err, "tools change consumer failed");
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to refresh tools after list change"),
        }
    }

    async fn refresh_resources(inner: Arc<ClientInner>) {
        let Some(session) = inner.session.get() else {
            debug!("resources change notification before session was available");
            return;
        };
        if inner.resources_refresh_inflight.swap(true, Ordering::SeqCst) {
            debug!("resources refresh already in flight, coalescing");
            return;
        }
        let result = session
            .request::<ListResourcesResult>(methods::RESOURCES_LIST, Some(json!({})))
            .await;
        inner.resources_refresh_inflight.store(false, Ordering::SeqCst);
        match result {
            Ok(list) => {
                for consumer in &inner.resources_consumers {
                    if let Err(err) = consumer(list.resources.clone()).await {
                        error!(error = %err, "resources change consumer failed");
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to refresh resources after list change"),
        }
    }

    async fn refresh_prompts(inner: Arc<ClientInner>) {
        let Some(session) = inner.session.get() else {
            debug!("prompts change notification before session was available");
            return;
        };
        if inner.prompts_refresh_inflight.swap(true, Ordering::SeqCst) {
            debug!("prompts refresh already in flight, coalescing");
            return;
        }
        let result = session
            .request::<ListPromptsResult>(methods::PROMPTS_LIST, Some(json!({})))
            .await;
        inner.prompts_refresh_inflight.store(false, Ordering::SeqCst);
        match result {
            Ok(list) => {
                for consumer in &inner.prompts_consumers {
                    if let Err(err) = consumer(list.prompts.clone()).await {
                        error!(error = %err, "prompts change consumer failed");
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to refresh prompts after list change"),
        }
    }
}

fn paginated(cursor: Option<Cursor>) -> McpResult<Value> {
    Ok(serde_json::to_value(PaginatedRequest::new(cursor))?)
}
