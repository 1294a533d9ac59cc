//! The session: the stateful correlation and dispatch layer over a transport.
//!
//! A session multiplexes outbound requests against inbound responses and
//! notifications on one duplex message stream. State mutations (`pending`,
//! `state`, id minting) happen under short synchronous locks; user handlers
//! run on spawned tasks behind a bounded permit pool so a slow handler never
//! stalls the transport's reader.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, error, warn};

use strand_mcp_protocol::{
    methods, JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};

use crate::error::{McpError, McpResult};
use crate::handler::{NotificationHandlerMap, RequestHandlerMap};
use crate::transport::{InboundHandler, Transport};

/// Session tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Deadline applied to every outbound request. Also bounds the drain
    /// window of [`Session::close_gracefully`]: every pending entry resolves
    /// by its own deadline at the latest.
    pub request_timeout: Duration,
    /// Maximum number of concurrently running inbound handlers. Beyond this,
    /// requests are answered with an internal error and notifications are
    /// dropped, both logged.
    pub max_concurrent_handlers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_concurrent_handlers: 32,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but not bound to a started transport.
    Unconnected,
    /// Transport started; only the `initialize` handshake may flow.
    Connected,
    /// Handshake complete; all operations accepted.
    Initialized,
    /// Graceful shutdown in progress; responses still drain.
    Closing,
    /// Terminal.
    Closed,
}

struct PendingRequest {
    method: String,
    sink: oneshot::Sender<McpResult<Value>>,
}

/// The stateful correlation and dispatch layer over a transport.
///
/// Cheap to clone; all clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    request_handlers: RequestHandlerMap,
    notification_handlers: NotificationHandlerMap,
    next_id: AtomicU64,
    state: Mutex<SessionState>,
    drained: Notify,
    dispatch_permits: Arc<Semaphore>,
}

impl Session {
    /// Bind a session to a transport and start it. The returned session is in
    /// [`SessionState::Connected`]; inbound messages begin flowing before
    /// this returns.
    pub async fn connect<T>(
        transport: T,
        config: SessionConfig,
        request_handlers: RequestHandlerMap,
        notification_handlers: NotificationHandlerMap,
    ) -> McpResult<Session>
    where
        T: Transport + 'static,
    {
        let inner = Arc::new(SessionInner {
            config,
            transport: Arc::new(transport),
            pending: Mutex::new(HashMap::new()),
            request_handlers,
            notification_handlers,
            next_id: AtomicU64::new(1),
            state: Mutex::new(SessionState::Connected),
            drained: Notify::new(),
            dispatch_permits: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
        });

        // The transport holds the handler for the lifetime of the connection;
        // a weak reference keeps the session collectable after close.
        let weak = Arc::downgrade(&inner);
        let handler: InboundHandler = Arc::new(move |message| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    SessionInner::handle_inbound(&inner, message).await;
                }
            })
        });
        inner.transport.start(handler).await?;
        Ok(Session { inner })
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Record a completed `initialize` handshake. The facades call this
    /// explicitly: the client after it validated the peer's protocol version
    /// and sent `notifications/initialized`, the server from its
    /// `notifications/initialized` handler. The session core never advances
    /// this on its own, so an unsolicited notification cannot skip the
    /// handshake.
    pub fn mark_initialized(&self) {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Connected {
            *state = SessionState::Initialized;
        }
    }

    /// Send a request and await its typed result.
    ///
    /// Exactly one of the following completes the call: the matching
    /// response, the per-request deadline, cancellation by session close, or
    /// a transport failure on send.
    pub async fn request<R>(&self, method: &str, params: Option<Value>) -> McpResult<R>
    where
        R: DeserializeOwned,
    {
        self.inner.check_outbound(method, true)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (sink, completion) = oneshot::channel();
        self.inner.pending.lock().insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                sink,
            },
        );
        // Removes the entry if the caller drops this future mid-flight;
        // removal is idempotent with response arrival and timeout.
        let _guard = PendingGuard {
            inner: Arc::downgrade(&self.inner),
            id: id.clone(),
        };

        let request = JsonRpcRequest::new(RequestId::String(id.clone()), method, params);
        if let Err(err) = self.inner.transport.send(request.into()).await {
            self.inner.remove_pending(&id);
            error!(error = %err, "transport send failed, closing session");
            self.inner.abort();
            return Err(McpError::Transport(err));
        }

        let outcome =
            match tokio::time::timeout(self.inner.config.request_timeout, completion).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(McpError::Cancelled),
                Err(_) => {
                    // First wins: if the response already removed the entry
                    // this is a no-op and the late completion was consumed.
                    self.inner.remove_pending(&id);
                    debug!(id = %id, method = %method, "request timed out");
                    Err(McpError::Timeout)
                }
            };

        serde_json::from_value(outcome?).map_err(McpError::Json)
    }

    /// Send a notification. Completes when the transport accepts the bytes;
    /// never creates a pending entry.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.inner.check_outbound(method, false)?;
        let notification = JsonRpcNotification::new(method, params);
        if let Err(err) = self.inner.transport.send(notification.into()).await {
            error!(error = %err, "transport send failed, closing session");
            self.inner.abort();
            return Err(McpError::Transport(err));
        }
        Ok(())
    }

    /// Graceful shutdown: refuse new operations, wait for in-flight requests
    /// to drain (bounded by the request timeout), cancel the rest, then close
    /// the transport.
    pub async fn close_gracefully(&self) -> McpResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Closed => return Ok(()),
                SessionState::Closing => {}
                _ => *state = SessionState::Closing,
            }
        }

        let drain = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.pending.lock().is_empty() {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.inner.config.request_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.pending.lock().len(),
                "drain window elapsed, cancelling remaining requests"
            );
        }

        self.inner.cancel_all_pending();
        let result = self.inner.transport.close_gracefully().await;
        *self.inner.state.lock() = SessionState::Closed;
        result.map_err(McpError::Transport)
    }

    /// Immediate shutdown: cancel every in-flight request now and release the
    /// transport in the background.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.inner.cancel_all_pending();

        let transport = Arc::clone(&self.inner.transport);
        tokio::spawn(async move {
            if let Err(err) = transport.close_gracefully().await {
                debug!(error = %err, "transport close failed during immediate close");
            }
        });
    }
}

impl SessionInner {
    fn check_outbound(&self, method: &str, is_request: bool) -> McpResult<()> {
        let state = *self.state.lock();
        match state {
            SessionState::Unconnected => Err(McpError::NotInitialized),
            SessionState::Connected => {
                let handshake = if is_request {
                    method == methods::INITIALIZE
                } else {
                    method == methods::NOTIFICATION_INITIALIZED
                };
                if handshake {
                    Ok(())
                } else {
                    Err(McpError::NotInitialized)
                }
            }
            SessionState::Initialized => {
                if is_request && method == methods::INITIALIZE {
                    Err(McpError::AlreadyInitialized)
                } else {
                    Ok(())
                }
            }
            SessionState::Closing | SessionState::Closed => Err(McpError::Closed),
        }
    }

    /// Entry point for the transport's inbound stream. Must return quickly:
    /// only routing happens here, handler execution is spawned.
    async fn handle_inbound(inner: &Arc<SessionInner>, message: JsonRpcMessage) {
        let state = *inner.state.lock();
        match state {
            SessionState::Closed => {
                debug!("dropping inbound message on closed session");
                return;
            }
            SessionState::Closing => {
                // Drain: responses still complete pending requests, anything
                // else would race the transport shutdown.
                match message {
                    JsonRpcMessage::Response(response) => inner.complete_pending(response),
                    other => {
                        debug!(method = ?other.method(), "dropping inbound message while closing")
                    }
                }
                return;
            }
            _ => {}
        }

        match message {
            JsonRpcMessage::Response(response) => inner.complete_pending(response),
            JsonRpcMessage::Request(request) => SessionInner::dispatch_request(inner, request),
            JsonRpcMessage::Notification(notification) => {
                SessionInner::dispatch_notification(inner, notification)
            }
        }
    }

    fn complete_pending(&self, response: JsonRpcResponse) {
        let key = response.id.to_key();
        let Some(entry) = self.remove_pending(&key) else {
            debug!(id = %key, "dropping response with no matching pending request");
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(McpError::from(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        // The receiver is gone when the request already timed out; the late
        // response is dropped on the floor by contract.
        let _ = entry.sink.send(outcome);
    }

    fn dispatch_request(inner: &Arc<SessionInner>, request: JsonRpcRequest) {
        match inner.dispatch_permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    inner.run_request_handler(request).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(method = %request.method, "handler pool exhausted, rejecting request");
                let reply = JsonRpcResponse::error(
                    request.id,
                    JsonRpcErrorObject::internal_error("handler pool exhausted"),
                );
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    inner.send_message(reply.into()).await;
                });
            }
        }
    }

    async fn run_request_handler(&self, request: JsonRpcRequest) {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let reply = match self.request_handlers.get(&method) {
            Some(handler) => match handler(params).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(err) => {
                    debug!(method = %method, error = %err, "request handler failed");
                    JsonRpcResponse::error(id, err.to_error_object())
                }
            },
            None => {
                warn!(method = %method, "no handler registered for request");
                JsonRpcResponse::error(id, JsonRpcErrorObject::method_not_found(&method))
            }
        };
        self.send_message(reply.into()).await;
    }

    fn dispatch_notification(inner: &Arc<SessionInner>, notification: JsonRpcNotification) {
        let Some(handler) = inner.notification_handlers.get(&notification.method) else {
            debug!(method = %notification.method, "no handler registered for notification");
            return;
        };
        let handler = Arc::clone(handler);
        match inner.dispatch_permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let JsonRpcNotification { method, params, .. } = notification;
                tokio::spawn(async move {
                    if let Err(err) = handler(params).await {
                        warn!(method = %method, error = %err, "notification handler failed");
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(method = %notification.method, "handler pool exhausted, dropping notification")
            }
        }
    }

    async fn send_message(&self, message: JsonRpcMessage) {
        if let Err(err) = self.transport.send(message).await {
            error!(error = %err, "transport send failed, closing session");
            self.abort();
        }
    }

    fn remove_pending(&self, id: &str) -> Option<PendingRequest> {
        let mut pending = self.pending.lock();
        let entry = pending.remove(id);
        if pending.is_empty() {
            self.drained.notify_waiters();
        }
        entry
    }

    fn cancel_all_pending(&self) {
        let entries: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (id, entry) in entries {
            debug!(id = %id, method = %entry.method, "cancelling in-flight request");
            let _ = entry.sink.send(Err(McpError::Cancelled));
        }
        self.drained.notify_waiters();
    }

    /// Transport failure is fatal: close immediately and cancel everything.
    fn abort(&self) {
        *self.state.lock() = SessionState::Closed;
        self.cancel_all_pending();
    }
}

/// Removes the pending entry when the caller cancels a `request` future.
struct PendingGuard {
    inner: Weak<SessionInner>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_pending(&self.id);
        }
    }
}
