//! The transport contract: an ordered duplex pipe of protocol messages.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use strand_mcp_protocol::JsonRpcMessage;

use crate::error::TransportError;

/// Callback invoked for every inbound message.
///
/// The transport must await the returned future before handing over the next
/// message; that await is the backpressure seam between wire reading and
/// session routing.
pub type InboundHandler = Arc<dyn Fn(JsonRpcMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// An ordered duplex pipe of protocol messages, exclusively owned by one
/// session.
///
/// Implementations only ferry opaque [`JsonRpcMessage`] values; correlation,
/// dispatch, and lifecycle live in the session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin producing inbound messages, delivering each to `handler` in
    /// wire-arrival order.
    async fn start(&self, handler: InboundHandler) -> Result<(), TransportError>;

    /// Enqueue one outbound message. Messages are delivered in call order;
    /// failure means a permanent transport error.
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    /// Stop accepting new sends, flush in-flight messages, then release
    /// resources. Idempotent.
    async fn close_gracefully(&self) -> Result<(), TransportError>;
}
