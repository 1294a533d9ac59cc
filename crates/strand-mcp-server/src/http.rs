//! HTTP endpoints for the SSE transport: a `GET` event stream per peer and a
//! `POST` message endpoint routed by session id.
//!
//! The session id is assigned on SSE connect and delivered twice: as a
//! cookie and inside the `endpoint` event. POSTs may carry it back either
//! way. Backpressure is per connection: the event stream body polls that
//! peer's bounded outbound queue, and the POST handler awaits the owning
//! session's routing before answering.

use bytes::Bytes;
use http_body::{Body, Frame};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use futures::future::BoxFuture;
use strand_mcp_protocol::JsonRpcMessage;
use strand_mcp_session::TransportError;

use crate::sse::{
    format_endpoint_event, format_message_event, SseServerTransport, KEEP_ALIVE_EVENT,
};

/// Cookie carrying the session id assigned on SSE connect.
pub const SESSION_COOKIE: &str = "strand-mcp-session";

/// Configuration for the SSE server endpoints.
#[derive(Debug, Clone)]
pub struct SseServerConfig {
    /// Address to bind to.
    pub bind_address: SocketAddr,
    /// Path serving the `GET` event stream.
    pub sse_path: String,
    /// Path accepting `POST`ed messages.
    pub message_path: String,
    /// Interval between keep-alive comments on an idle stream.
    pub keep_alive_interval: Duration,
    /// Outbound messages buffered per connection before senders block.
    pub outbound_queue: usize,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".parse().expect("valid literal address"),
            sse_path: "/sse".to_string(),
            message_path: "/message".to_string(),
            keep_alive_interval: Duration::from_secs(15),
            outbound_queue: 64,
        }
    }
}

/// Called once per SSE connect with the new peer's transport; expected to
/// bind a session (`Session::connect` or a facade) before returning.
pub type ConnectHandler = Arc<dyn Fn(SseServerTransport) -> BoxFuture<'static, ()> + Send + Sync>;

type ConnectionMap = Arc<RwLock<HashMap<String, SseServerTransport>>>;

struct ServerShared {
    config: SseServerConfig,
    connections: ConnectionMap,
    on_connect: ConnectHandler,
}

/// The SSE server: accepts connections and routes the two endpoints.
pub struct SseServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
}

impl SseServer {
    /// Bind the listener. Serving starts with [`SseServer::serve`].
    pub async fn bind<F, Fut>(config: SseServerConfig, on_connect: F) -> Result<Self, TransportError>
    where
        F: Fn(SseServerTransport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(config.bind_address)
            .await
            .map_err(TransportError::Io)?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;
        let on_connect: ConnectHandler = Arc::new(move |transport| Box::pin(on_connect(transport)));
        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(ServerShared {
                config,
                connections: Arc::new(RwLock::new(HashMap::new())),
                on_connect,
            }),
        })
    }

    /// The actually bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self) -> Result<(), TransportError> {
        info!(addr = %self.local_addr, "sse server listening");
        loop {
            let (stream, peer) = self.listener.accept().await.map_err(TransportError::Io)?;
            debug!(peer = %peer, "http connection accepted");
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let service =
                    service_fn(move |request| handle_request(Arc::clone(&shared), request));
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(error = %err, "http connection ended");
                }
            });
        }
    }
}

async fn handle_request(
    shared: Arc<ServerShared>,
    request: Request<Incoming>,
) -> Result<Response<HttpBody>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = if method == Method::GET && path == shared.config.sse_path {
        handle_sse_connect(shared).await
    } else if method == Method::POST && path == shared.config.message_path {
        handle_message_post(shared, request).await
    } else {
        simple_response(StatusCode::NOT_FOUND, "Not Found")
    };
    Ok(response)
}

async fn handle_sse_connect(shared: Arc<ServerShared>) -> Response<HttpBody> {
    let session_id = Uuid::new_v4().to_string();
    let (transport, outbound_rx) =
        SseServerTransport::new(session_id.clone(), shared.config.outbound_queue);
    shared
        .connections
        .write()
        .insert(session_id.clone(), transport.clone());
    info!(session_id = %session_id, "sse peer connected");

    // The user callback binds a session to the transport; inbound POSTs for
    // this id fail until it does.
    (shared.on_connect)(transport).await;

    let endpoint = format!("{}?sessionId={}", shared.config.message_path, session_id);
    let body = SseBody {
        pending: Some(Bytes::from(format_endpoint_event(&endpoint))),
        outbound: outbound_rx,
        keep_alive: shared.config.keep_alive_interval,
        timer: Box::pin(tokio::time::sleep(shared.config.keep_alive_interval)),
        connections: Arc::clone(&shared.connections),
        session_id: session_id.clone(),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(SET_COOKIE, format!("{}={}; Path=/", SESSION_COOKIE, session_id))
        .body(HttpBody::Sse(body))
        .expect("static response parts are valid")
}

async fn handle_message_post(
    shared: Arc<ServerShared>,
    request: Request<Incoming>,
) -> Response<HttpBody> {
    let Some(session_id) = extract_session_id(&request) else {
        return simple_response(StatusCode::BAD_REQUEST, "Missing session id");
    };
    let transport = shared.connections.read().get(&session_id).cloned();
    let Some(transport) = transport else {
        warn!(session_id = %session_id, "post for unknown session");
        return simple_response(StatusCode::NOT_FOUND, "Unknown session");
    };

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            debug!(error = %err, "failed reading post body");
            return simple_response(StatusCode::BAD_REQUEST, "Unreadable body");
        }
    };
    let Ok(text) = std::str::from_utf8(&body) else {
        return simple_response(StatusCode::BAD_REQUEST, "Body is not valid UTF-8");
    };
    let message = match JsonRpcMessage::from_json(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "rejecting malformed message");
            return simple_response(StatusCode::BAD_REQUEST, "Malformed message");
        }
    };

    match transport.handle_inbound(message).await {
        Ok(()) => simple_response(StatusCode::ACCEPTED, "Accepted"),
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "inbound routing failed");
            simple_response(StatusCode::INTERNAL_SERVER_ERROR, "Routing failed")
        }
    }
}

fn extract_session_id(request: &Request<Incoming>) -> Option<String> {
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("sessionId=") {
                return Some(value.to_string());
            }
        }
    }
    let cookies = request.headers().get(COOKIE)?.to_str().ok()?;
    for cookie in cookies.split(';') {
        if let Some(value) = cookie
            .trim()
            .strip_prefix(SESSION_COOKIE)
            .and_then(|rest| rest.strip_prefix('='))
        {
            return Some(value.to_string());
        }
    }
    None
}

fn simple_response(status: StatusCode, body: &'static str) -> Response<HttpBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(HttpBody::Full(Full::new(Bytes::from_static(body.as_bytes()))))
        .expect("static response parts are valid")
}

/// Response body: either a plain payload or a live event stream.
enum HttpBody {
    Full(Full<Bytes>),
    Sse(SseBody),
}

impl Body for HttpBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        match self.get_mut() {
            HttpBody::Full(body) => Pin::new(body).poll_frame(cx),
            HttpBody::Sse(body) => Pin::new(body).poll_frame(cx),
        }
    }
}

/// Streams one peer's outbound queue as SSE frames, interleaving keep-alive
/// comments while idle. Dropping the body deregisters the connection.
struct SseBody {
    pending: Option<Bytes>,
    outbound: mpsc::Receiver<JsonRpcMessage>,
    keep_alive: Duration,
    timer: Pin<Box<Sleep>>,
    connections: ConnectionMap,
    session_id: String,
}

impl Body for SseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let this = self.get_mut();
        if let Some(first) = this.pending.take() {
            return Poll::Ready(Some(Ok(Frame::data(first))));
        }
        match this.outbound.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                this.timer.as_mut().reset(Instant::now() + this.keep_alive);
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(format_message_event(
                    &message,
                ))))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.timer.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.timer.as_mut().reset(Instant::now() + this.keep_alive);
                    Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(
                        KEEP_ALIVE_EVENT.as_bytes(),
                    )))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl Drop for SseBody {
    fn drop(&mut self) {
        self.connections.write().remove(&self.session_id);
        debug!(session_id = %self.session_id, "sse peer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_the_standard_paths() {
        let config = SseServerConfig::default();
        assert_eq!(config.sse_path, "/sse");
        assert_eq!(config.message_path, "/message");
        assert!(config.outbound_queue > 0);
    }
}
