//! Server dispatch over a scripted in-memory transport.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use strand_mcp_protocol::jsonrpc::error_codes;
use strand_mcp_protocol::{
    methods, CallToolResult, ClientCapabilities, Content, GetPromptResult, Implementation,
    InitializeRequest, InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListRootsResult, Prompt, PromptMessage, ProtocolVersion, ReadResourceResult,
    RequestId, Resource, ResourceContents, Role, Root, Tool,
};
use strand_mcp_server::{McpServer, McpServerBuilder};
use strand_mcp_session::{InboundHandler, Transport, TransportError};

#[derive(Clone)]
struct MockTransport(Arc<MockInner>);

struct MockInner {
    handler: Mutex<Option<InboundHandler>>,
    sent: Mutex<Vec<JsonRpcMessage>>,
    sent_signal: Notify,
}

impl MockTransport {
    fn new() -> Self {
        Self(Arc::new(MockInner {
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            sent_signal: Notify::new(),
        }))
    }

    fn sent(&self) -> Vec<JsonRpcMessage> {
        self.0.sent.lock().unwrap().clone()
    }

    async fn incoming(&self, message: JsonRpcMessage) {
        let handler = self
            .0
            .handler
            .lock()
            .unwrap()
            .clone()
            .expect("transport not started");
        handler(message).await;
    }

    async fn wait_for_sent(&self, count: usize) -> Vec<JsonRpcMessage> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let sent = self.0.sent.lock().unwrap();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            let notified = self.0.sent_signal.notified();
            if tokio::time::Instant::now() > deadline {
                panic!("expected {} sent messages, got {:?}", count, self.sent());
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, handler: InboundHandler) -> Result<(), TransportError> {
        *self.0.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.0.sent.lock().unwrap().push(message);
        self.0.sent_signal.notify_waiters();
        Ok(())
    }

    async fn close_gracefully(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn response_of(message: &JsonRpcMessage) -> &JsonRpcResponse {
    match message {
        JsonRpcMessage::Response(response) => response,
        other => panic!("expected response, got {:?}", other),
    }
}

fn request_of(message: &JsonRpcMessage) -> &JsonRpcRequest {
    match message {
        JsonRpcMessage::Request(request) => request,
        other => panic!("expected request, got {:?}", other),
    }
}

fn test_builder() -> McpServerBuilder {
    McpServer::builder()
        .server_info(Implementation::new("test-server", "1.0.0"))
        .instructions("Test instructions")
        .tool(
            Tool::new("echo", json!({"type": "object"})).with_description("Echoes its arguments"),
            |arguments| async move {
                Ok(CallToolResult::text(
                    arguments.unwrap_or(Value::Null).to_string(),
                ))
            },
        )
        .resource(
            Resource::new("test://resource", "Test Resource").with_mime_type("text/plain"),
            |request| async move {
                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::Text {
                        uri: request.uri,
                        mime_type: Some("text/plain".to_string()),
                        text: "hello".to_string(),
                    }],
                })
            },
        )
        .prompt(Prompt::new("greet"), |_request| async move {
            Ok(GetPromptResult {
                description: None,
                messages: vec![PromptMessage {
                    role: Role::User,
                    content: Content::text("hi"),
                }],
            })
        })
}

async fn connect(mock: &MockTransport) -> McpServer {
    test_builder().connect(mock.clone()).await.unwrap()
}

fn initialize_params() -> Value {
    serde_json::to_value(InitializeRequest::new(
        ProtocolVersion::LATEST,
        ClientCapabilities::default().with_roots(true),
        Implementation::new("test-client", "1.0.0"),
    ))
    .unwrap()
}

/// Drive the handshake from the peer's side: initialize request plus the
/// initialized notification.
async fn initialize(server: &McpServer, mock: &MockTransport) {
    mock.incoming(
        JsonRpcRequest::new(RequestId::from("init"), methods::INITIALIZE, Some(initialize_params()))
            .into(),
    )
    .await;
    mock.wait_for_sent(1).await;
    mock.incoming(JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None).into())
        .await;

    // The state advance runs on the spawned notification handler.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !server.is_initialized() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(server.is_initialized());
}

#[tokio::test]
async fn initialize_replies_with_capabilities_and_stores_client_state() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;
    assert!(!server.is_initialized());

    mock.incoming(
        JsonRpcRequest::new(RequestId::from("1"), methods::INITIALIZE, Some(initialize_params()))
            .into(),
    )
    .await;

    let sent = mock.wait_for_sent(1).await;
    let response = response_of(&sent[0]);
    assert_eq!(response.id, RequestId::from("1"));
    let result: InitializeResult =
        serde_json::from_value(response.result.clone().unwrap()).unwrap();
    assert_eq!(result.protocol_version, ProtocolVersion::LATEST.as_str());
    assert!(result.capabilities.tools.is_some());
    assert!(result.capabilities.resources.is_some());
    assert!(result.capabilities.prompts.is_some());
    assert_eq!(result.server_info.name, "test-server");
    assert_eq!(result.instructions.as_deref(), Some("Test instructions"));

    assert_eq!(
        server.client_info(),
        Some(Implementation::new("test-client", "1.0.0"))
    );
    assert!(server.client_capabilities().unwrap().roots.is_some());
}

#[tokio::test]
async fn initialize_with_unknown_version_offers_latest() {
    let mock = MockTransport::new();
    let _server = connect(&mock).await;

    let mut params = initialize_params();
    params["protocolVersion"] = json!("1999-01-01");
    mock.incoming(
        JsonRpcRequest::new(RequestId::from("1"), methods::INITIALIZE, Some(params)).into(),
    )
    .await;

    let sent = mock.wait_for_sent(1).await;
    let result: InitializeResult =
        serde_json::from_value(response_of(&sent[0]).result.clone().unwrap()).unwrap();
    assert_eq!(result.protocol_version, ProtocolVersion::LATEST.as_str());
}

#[tokio::test]
async fn tools_are_listed_and_called() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;
    initialize(&server, &mock).await;

    mock.incoming(
        JsonRpcRequest::new(RequestId::from("2"), methods::TOOLS_LIST, Some(json!({}))).into(),
    )
    .await;
    let sent = mock.wait_for_sent(2).await;
    let result = response_of(&sent[1]).result.clone().unwrap();
    assert_eq!(result["tools"][0]["name"], "echo");
    assert_eq!(result["tools"][0]["description"], "Echoes its arguments");

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("3"),
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"x": 1}})),
        )
        .into(),
    )
    .await;
    let sent = mock.wait_for_sent(3).await;
    let result = response_of(&sent[2]).result.clone().unwrap();
    assert_eq!(result["content"][0]["type"], "text");
    assert_eq!(result["content"][0]["text"], r#"{"x":1}"#);
}

#[tokio::test]
async fn unknown_tool_is_invalid_params() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;
    initialize(&server, &mock).await;

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("4"),
            methods::TOOLS_CALL,
            Some(json!({"name": "missing"})),
        )
        .into(),
    )
    .await;
    let sent = mock.wait_for_sent(2).await;
    let error = response_of(&sent[1]).error.as_ref().unwrap();
    assert_eq!(error.code, error_codes::INVALID_PARAMS);
    assert!(error.message.contains("missing"));
}

#[tokio::test]
async fn resources_are_read_and_subscriptions_tracked() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;
    initialize(&server, &mock).await;

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("5"),
            methods::RESOURCES_READ,
            Some(json!({"uri": "test://resource"})),
        )
        .into(),
    )
    .await;
    let sent = mock.wait_for_sent(2).await;
    let result = response_of(&sent[1]).result.clone().unwrap();
    assert_eq!(result["contents"][0]["text"], "hello");

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("6"),
            methods::RESOURCES_SUBSCRIBE,
            Some(json!({"uri": "test://resource"})),
        )
        .into(),
    )
    .await;
    mock.wait_for_sent(3).await;
    assert_eq!(server.subscriptions(), vec!["test://resource".to_string()]);

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("7"),
            methods::RESOURCES_UNSUBSCRIBE,
            Some(json!({"uri": "test://resource"})),
        )
        .into(),
    )
    .await;
    mock.wait_for_sent(4).await;
    assert!(server.subscriptions().is_empty());

    // Unsubscribing again is an error.
    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("8"),
            methods::RESOURCES_UNSUBSCRIBE,
            Some(json!({"uri": "test://resource"})),
        )
        .into(),
    )
    .await;
    let sent = mock.wait_for_sent(5).await;
    let error = response_of(&sent[4]).error.as_ref().unwrap();
    assert_eq!(error.code, error_codes::INVALID_PARAMS);
}

#[tokio::test]
async fn prompts_are_listed_and_rendered() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;
    initialize(&server, &mock).await;

    mock.incoming(
        JsonRpcRequest::new(RequestId::from("9"), methods::PROMPTS_LIST, Some(json!({}))).into(),
    )
    .await;
    let sent = mock.wait_for_sent(2).await;
    let result = response_of(&sent[1]).result.clone().unwrap();
    assert_eq!(result["prompts"][0]["name"], "greet");

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("10"),
            methods::PROMPTS_GET,
            Some(json!({"name": "greet"})),
        )
        .into(),
    )
    .await;
    let sent = mock.wait_for_sent(3).await;
    let result = response_of(&sent[2]).result.clone().unwrap();
    assert_eq!(result["messages"][0]["content"]["text"], "hi");
}

#[tokio::test]
async fn undeclared_features_are_method_not_found() {
    let mock = MockTransport::new();
    // No resources or prompts registered: only tools are declared.
    let server = McpServer::builder()
        .tool(Tool::new("echo", json!({"type": "object"})), |_| async move {
            Ok(CallToolResult::text("ok"))
        })
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&server, &mock).await;

    mock.incoming(
        JsonRpcRequest::new(RequestId::from("11"), methods::RESOURCES_LIST, Some(json!({})))
            .into(),
    )
    .await;
    let sent = mock.wait_for_sent(2).await;
    let error = response_of(&sent[1]).error.as_ref().unwrap();
    assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn ping_is_answered_with_an_empty_object() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;
    initialize(&server, &mock).await;

    mock.incoming(JsonRpcRequest::new(RequestId::from("12"), methods::PING, None).into())
        .await;
    let sent = mock.wait_for_sent(2).await;
    let response = response_of(&sent[1]);
    assert!(response.error.is_none());
    assert_eq!(response.result, Some(json!({})));
}

#[tokio::test]
async fn list_roots_requires_initialization_then_round_trips() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;

    // Before the handshake the session refuses outbound requests.
    let err = server.list_roots().await.unwrap_err();
    assert!(matches!(err, strand_mcp_session::McpError::NotInitialized));

    initialize(&server, &mock).await;

    let call = {
        let server = server.clone();
        tokio::spawn(async move { server.list_roots().await })
    };
    let sent = mock.wait_for_sent(2).await;
    let request = request_of(&sent[1]);
    assert_eq!(request.method, methods::ROOTS_LIST);
    mock.incoming(
        JsonRpcResponse::success(
            request.id.clone(),
            serde_json::to_value(ListRootsResult::new(vec![
                Root::new("file:///test/path").with_name("test-root"),
            ]))
            .unwrap(),
        )
        .into(),
    )
    .await;

    let roots = call.await.unwrap().unwrap();
    assert_eq!(roots.roots.len(), 1);
    assert_eq!(roots.roots[0].uri, "file:///test/path");
}

#[tokio::test]
async fn list_changed_notifications_are_sent() {
    let mock = MockTransport::new();
    let server = connect(&mock).await;
    initialize(&server, &mock).await;

    server.notify_tools_list_changed().await.unwrap();
    let sent = mock.wait_for_sent(2).await;
    match &sent[1] {
        JsonRpcMessage::Notification(notification) => {
            assert_eq!(notification.method, methods::NOTIFICATION_TOOLS_LIST_CHANGED)
        }
        other => panic!("expected notification, got {:?}", other),
    }
}

#[tokio::test]
async fn roots_change_notification_triggers_refresh() {
    let mock = MockTransport::new();
    let received: Arc<Mutex<Vec<Root>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let server = test_builder()
        .roots_change_consumer(move |roots| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().extend(roots);
                Ok(())
            }
        })
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&server, &mock).await;

    mock.incoming(
        JsonRpcNotification::new(methods::NOTIFICATION_ROOTS_LIST_CHANGED, None).into(),
    )
    .await;

    let sent = mock.wait_for_sent(2).await;
    let request = request_of(&sent[1]);
    assert_eq!(request.method, methods::ROOTS_LIST);
    mock.incoming(
        JsonRpcResponse::success(
            request.id.clone(),
            json!({"roots": [{"uri": "file:///x", "name": "r"}]}),
        )
        .into(),
    )
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while received.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let roots = received.lock().unwrap().clone();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].uri, "file:///x");
}
