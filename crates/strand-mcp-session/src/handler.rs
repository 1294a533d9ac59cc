//! Handler types for inbound requests and notifications.
//!
//! Handlers are installed at session construction and never mutated
//! afterwards, so they are plain `Arc`'d closures rather than a registry
//! with interior mutability.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::McpResult;

/// Handles one inbound request; the returned value becomes the response
/// `result`, an error becomes the response `error`.
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, McpResult<Value>> + Send + Sync>;

/// Handles one inbound notification. Errors are logged and swallowed by the
/// session; notifications never produce responses.
pub type NotificationHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

/// Method-to-handler maps as passed to `Session::connect`.
pub type RequestHandlerMap = HashMap<String, RequestHandler>;
pub type NotificationHandlerMap = HashMap<String, NotificationHandler>;

/// Wrap an async closure as a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<Value>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

/// Wrap an async closure as a [`NotificationHandler`].
pub fn notification_handler<F, Fut>(f: F) -> NotificationHandler
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<()>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}
