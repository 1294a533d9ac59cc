//! Per-connection SSE transport and event framing.
//!
//! Each connected peer gets its own [`SseServerTransport`]: outbound
//! messages flow through a bounded queue into that peer's event stream, so a
//! slow reader blocks its own session's writers and nobody else's. Inbound
//! messages arrive via the POST endpoint and are routed by session id.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::warn;

use strand_mcp_protocol::JsonRpcMessage;
use strand_mcp_session::{InboundHandler, Transport, TransportError};

/// Format one outbound message as an SSE event group.
pub fn format_message_event(message: &JsonRpcMessage) -> String {
    let data = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    format!("event: message\ndata: {}\n\n", data)
}

/// Format the endpoint event sent once at stream start, telling the peer
/// where to POST its messages.
pub fn format_endpoint_event(endpoint: &str) -> String {
    format!("event: endpoint\ndata: {}\n\n", endpoint)
}

/// SSE comment used as a keep-alive; comments carry no event.
pub const KEEP_ALIVE_EVENT: &str = ": keepalive\n\n";

/// Server-side transport for one SSE peer. Cheap to clone; the HTTP layer
/// keeps one clone in its routing map and the session owns another.
#[derive(Clone)]
pub struct SseServerTransport(Arc<SseInner>);

struct SseInner {
    session_id: String,
    outbound: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    handler: OnceLock<InboundHandler>,
}

impl SseServerTransport {
    /// Create the transport and the receiving half of its outbound queue.
    /// The HTTP layer turns the receiver into the event stream body.
    pub(crate) fn new(
        session_id: String,
        queue: usize,
    ) -> (Self, mpsc::Receiver<JsonRpcMessage>) {
        let (tx, rx) = mpsc::channel(queue);
        let transport = Self(Arc::new(SseInner {
            session_id,
            outbound: Mutex::new(Some(tx)),
            handler: OnceLock::new(),
        }));
        (transport, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.0.session_id
    }

    /// Route one message from the POST endpoint into the owning session.
    /// Awaits the session's routing, so a busy session backpressures its own
    /// poster.
    pub(crate) async fn handle_inbound(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let handler = self.0.handler.get().ok_or_else(|| {
            TransportError::ConnectionFailed("no session bound to this connection".to_string())
        })?;
        handler(message).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn start(&self, handler: InboundHandler) -> Result<(), TransportError> {
        self.0.handler.set(handler).map_err(|_| {
            TransportError::ConnectionFailed("sse transport already started".to_string())
        })
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let sender = self
            .0
            .outbound
            .lock()
            .as_ref()
            .cloned()
            .ok_or(TransportError::Closed)?;
        sender
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close_gracefully(&self) -> Result<(), TransportError> {
        // Dropping the sender ends the event stream once queued messages
        // have been flushed to the peer.
        if self.0.outbound.lock().take().is_none() {
            warn!(session_id = %self.0.session_id, "sse transport already closed");
        }
        Ok(())
    }
}
