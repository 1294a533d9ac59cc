//! Client behavior against a scripted in-memory transport: the initialize
//! handshake, change-notification fan-out, and inbound request handling for
//! roots and sampling.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use strand_mcp_client::{ClientError, McpClient, McpClientBuilder};
use strand_mcp_protocol::jsonrpc::error_codes;
use strand_mcp_protocol::{
    methods, ClientCapabilities, Content, CreateMessageResult, Implementation, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ProtocolVersion,
    RequestId, Role, Root, ServerCapabilities, StopReason, Tool,
};
use strand_mcp_session::{InboundHandler, McpError, Transport, TransportError};

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

fn request_of(message: &JsonRpcMessage) -> &JsonRpcRequest {
    match message {
        JsonRpcMessage::Request(request) => request,
        other => panic!("expected request, got {:?}", other),
    }
}

fn response_of(message: &JsonRpcMessage) -> &JsonRpcResponse {
    match message {
        JsonRpcMessage::Response(response) => response,
        other => panic!("expected response, got {:?}", other),
    }
}

fn mock_init_result() -> InitializeResult {
    InitializeResult::new(
        ProtocolVersion::LATEST,
        ServerCapabilities::default()
            .with_tools(true)
            .with_resources(true, true),
        Implementation::new("test-server", "1.0.0"),
    )
    .with_instructions("Test instructions")
}

/// Run the handshake against the mock: answer the initialize request and
/// wait for the initialized notification.
async fn initialize(client: &McpClient, mock: &MockTransport) -> InitializeResult {
    let handshake = {
        let client = client.clone();
        tokio::spawn(async move { client.initialize().await })
    };
    let sent = mock.wait_for_sent(1).await;
    let request = request_of(&sent[0]);
    assert_eq!(request.method, methods::INITIALIZE);

    mock.incoming(
        JsonRpcResponse::success(
            request.id.clone(),
            serde_json::to_value(mock_init_result()).unwrap(),
        )
        .into(),
    )
    .await;

    let result = handshake.await.unwrap().unwrap();
    mock.wait_for_sent(2).await;
    result
}

#[tokio::test]
async fn successful_initialization() {
    let mock = MockTransport::new();
    let client = McpClientBuilder::new().connect(mock.clone()).await.unwrap();
    assert!(!client.is_initialized());

    let result = initialize(&client, &mock).await;

    // The last sent message is the initialized notification.
    let sent = mock.sent();
    assert_eq!(sent.len(), 2);
    match &sent[1] {
        JsonRpcMessage::Notification(notification) => {
            assert_eq!(notification.method, methods::NOTIFICATION_INITIALIZED)
        }
        other => panic!("expected notification, got {:?}", other),
    }

    assert_eq!(result.protocol_version, ProtocolVersion::LATEST.as_str());
    assert_eq!(result.instructions.as_deref(), Some("Test instructions"));
    assert!(client.is_initialized());
    assert_eq!(
        client.server_info(),
        Some(Implementation::new("test-server", "1.0.0"))
    );
    assert!(client.server_capabilities().unwrap().tools.is_some());
}

#[tokio::test]
async fn version_mismatch_fails_without_initialized_notification() {
    let mock = MockTransport::new();
    let client = McpClientBuilder::new().connect(mock.clone()).await.unwrap();

    let handshake = {
        let client = client.clone();
        tokio::spawn(async move { client.initialize().await })
    };
    let sent = mock.wait_for_sent(1).await;
    let request = request_of(&sent[0]);

    let mut stale = serde_json::to_value(mock_init_result()).unwrap();
    stale["protocolVersion"] = json!("1999-01-01");
    mock.incoming(JsonRpcResponse::success(request.id.clone(), stale).into())
        .await;

    let err = handshake.await.unwrap().unwrap_err();
    match err {
        ClientError::Session(McpError::VersionMismatch { actual, .. }) => {
            assert_eq!(actual, "1999-01-01")
        }
        other => panic!("expected version mismatch, got {:?}", other),
    }

    // No initialized notification was sent.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.sent().len(), 1);
    assert!(!client.is_initialized());
}

#[tokio::test]
async fn tools_change_notification_refreshes_and_fans_out() {
    let mock = MockTransport::new();
    let received: Arc<Mutex<Vec<Tool>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let client = McpClientBuilder::new()
        .tools_change_consumer(move |tools| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().extend(tools);
                Ok(())
            }
        })
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&client, &mock).await;

    mock.incoming(
        JsonRpcNotification::new(methods::NOTIFICATION_TOOLS_LIST_CHANGED, None).into(),
    )
    .await;

    // The client re-lists tools; answer with a one-element list.
    let sent = mock.wait_for_sent(3).await;
    let list_request = request_of(&sent[2]);
    assert_eq!(list_request.method, methods::TOOLS_LIST);
    mock.incoming(
        JsonRpcResponse::success(
            list_request.id.clone(),
            json!({"tools": [{"name": "t1", "description": "d", "inputSchema": "{}"}]}),
        )
        .into(),
    )
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while received.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let tools = received.lock().unwrap().clone();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "t1");
    assert_eq!(tools[0].description.as_deref(), Some("d"));
}

#[tokio::test]
async fn roots_list_request_is_answered_from_client_state() {
    let mock = MockTransport::new();
    let client = McpClientBuilder::new()
        .root(Root::new("file:///x").with_name("r"))
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&client, &mock).await;

    mock.incoming(JsonRpcRequest::new(RequestId::from("7"), methods::ROOTS_LIST, None).into())
        .await;

    let sent = mock.wait_for_sent(3).await;
    let response = response_of(&sent[2]);
    assert_eq!(response.id, RequestId::from("7"));
    assert!(response.error.is_none());
    assert_eq!(
        response.result,
        Some(json!({"roots": [{"uri": "file:///x", "name": "r"}]}))
    );
}

#[tokio::test]
async fn sampling_request_without_capability_is_method_not_found() {
    let mock = MockTransport::new();
    let client = McpClientBuilder::new()
        .capabilities(ClientCapabilities::default())
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&client, &mock).await;

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("9"),
            methods::SAMPLING_CREATE_MESSAGE,
            Some(json!({"messages": [], "maxTokens": 10})),
        )
        .into(),
    )
    .await;

    let sent = mock.wait_for_sent(3).await;
    let response = response_of(&sent[2]);
    assert_eq!(response.id, RequestId::from("9"));
    assert!(response.result.is_none());
    let error = response.error.as_ref().unwrap();
    assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
    assert_eq!(error.message, "Method not found: sampling/createMessage");
}

#[tokio::test]
async fn sampling_request_is_answered_by_the_handler() {
    let mock = MockTransport::new();
    let client = McpClientBuilder::new()
        .capabilities(ClientCapabilities::default().with_sampling())
        .sampling_handler(|request| async move {
            let content = request.messages[0].content.clone();
            Ok(CreateMessageResult {
                role: Role::Assistant,
                content,
                model: "test-model".to_string(),
                stop_reason: Some(StopReason::EndTurn),
            })
        })
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&client, &mock).await;

    mock.incoming(
        JsonRpcRequest::new(
            RequestId::from("11"),
            methods::SAMPLING_CREATE_MESSAGE,
            Some(json!({
                "messages": [
                    {"role": "user", "content": {"type": "text", "text": "Test message"}}
                ],
                "systemPrompt": "Test system prompt",
                "includeContext": "none",
                "temperature": 0.7,
                "maxTokens": 100
            })),
        )
        .into(),
    )
    .await;

    let sent = mock.wait_for_sent(3).await;
    let response = response_of(&sent[2]);
    assert_eq!(response.id, RequestId::from("11"));
    assert!(response.error.is_none());
    let result: CreateMessageResult =
        serde_json::from_value(response.result.clone().unwrap()).unwrap();
    assert_eq!(result.role, Role::Assistant);
    assert_eq!(result.content, Content::text("Test message"));
    assert_eq!(result.model, "test-model");
    assert_eq!(result.stop_reason, Some(StopReason::EndTurn));
}

#[tokio::test]
async fn sampling_capability_without_handler_fails_fast() {
    let mock = MockTransport::new();
    let err = McpClientBuilder::new()
        .capabilities(ClientCapabilities::default().with_sampling())
        .connect(mock)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Session(McpError::Config(_))));
}

#[tokio::test]
async fn request_timeout_empties_pending_and_drops_late_response() {
    let mock = MockTransport::new();
    let client = McpClientBuilder::new()
        .request_timeout(Duration::from_millis(100))
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&client, &mock).await;

    let started = tokio::time::Instant::now();
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::Session(McpError::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(500));

    // A response arriving after the deadline is dropped.
    let sent = mock.wait_for_sent(3).await;
    let stale = request_of(&sent[2]);
    mock.incoming(JsonRpcResponse::success(stale.id.clone(), json!({})).into())
        .await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.ping().await })
    };
    let sent = mock.wait_for_sent(4).await;
    let request = request_of(&sent[3]);
    mock.incoming(JsonRpcResponse::success(request.id.clone(), json!({"alive": true})).into())
        .await;
    assert_eq!(call.await.unwrap().unwrap(), json!({"alive": true}));
}

#[tokio::test]
async fn roots_mutations_enforce_capability_and_uniqueness() {
    // Without the roots capability both mutations fail.
    let mock = MockTransport::new();
    let client = McpClientBuilder::new()
        .capabilities(ClientCapabilities::default())
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&client, &mock).await;

    let err = client.add_root(Root::new("file:///x")).await.unwrap_err();
    assert!(matches!(err, ClientError::CapabilityMissing("roots")));
    let err = client.remove_root("file:///x").await.unwrap_err();
    assert!(matches!(err, ClientError::CapabilityMissing("roots")));

    // With listChanged declared, mutations announce themselves.
    let mock = MockTransport::new();
    let client = McpClientBuilder::new()
        .capabilities(ClientCapabilities::default().with_roots(true))
        .connect(mock.clone())
        .await
        .unwrap();
    initialize(&client, &mock).await;

    client.add_root(Root::new("file:///x").with_name("r")).await.unwrap();
    let sent = mock.wait_for_sent(3).await;
    match &sent[2] {
        JsonRpcMessage::Notification(notification) => {
            assert_eq!(notification.method, methods::NOTIFICATION_ROOTS_LIST_CHANGED)
        }
        other => panic!("expected notification, got {:?}", other),
    }

    let err = client.add_root(Root::new("file:///x")).await.unwrap_err();
    assert!(matches!(err, ClientError::RootExists(uri) if uri == "file:///x"));

    client.remove_root("file:///x").await.unwrap();
    let err = client.remove_root("file:///x").await.unwrap_err();
    assert!(matches!(err, ClientError::RootNotFound(uri) if uri == "file:///x"));
}
