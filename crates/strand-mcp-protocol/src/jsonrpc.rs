//! JSON-RPC 2.0 message types and classification.
//!
//! Inbound bytes are decoded to an untyped [`serde_json::Value`] first and
//! then classified by field presence: `method` + `id` is a request, `method`
//! without `id` is a notification, `id` with exactly one of `result`/`error`
//! is a response. Anything else is malformed and rejected so the transport
//! can drop it and keep reading.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// JSON-RPC protocol version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A request identifier. JSON-RPC permits strings and integers; this
/// implementation always mints strings but accepts either from peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl RequestId {
    /// Canonical map key for correlation. Numbers and their decimal string
    /// form collide by design: peers must echo ids verbatim, and this
    /// implementation only mints strings.
    pub fn to_key(&self) -> String {
        match self {
            RequestId::String(s) => s.clone(),
            RequestId::Number(n) => n.to_string(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// A JSON-RPC request: expects exactly one response with the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification: fire-and-forget, never answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message, None)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message, None)
    }
}

impl fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// A JSON-RPC response. Constructors guarantee that exactly one of
/// `result`/`error` is present; void results are carried as `result: null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<RequestId>, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Why an inbound payload could not be classified as a protocol message.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("batch messages are not supported")]
    Batch,

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing or unsupported jsonrpc version")]
    InvalidVersion,

    #[error("message has neither a routable method nor a result/error pair")]
    Unclassifiable,
}

/// One protocol message: request, notification, or response.
///
/// Serialization is untagged (each variant carries its own shape);
/// deserialization goes through [`JsonRpcMessage::from_value`] so that
/// malformed frames surface a [`ClassifyError`] instead of a best-effort
/// guess.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Classify a decoded-but-untyped payload into a typed message.
    pub fn from_value(value: Value) -> Result<Self, ClassifyError> {
        if value.is_array() {
            return Err(ClassifyError::Batch);
        }
        let object = value.as_object().ok_or(ClassifyError::NotAnObject)?;

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            _ => return Err(ClassifyError::InvalidVersion),
        }

        let has_id = object.contains_key("id");
        let has_method = object.contains_key("method");

        if has_method && has_id {
            Ok(JsonRpcMessage::Request(serde_json::from_value(value)?))
        } else if has_method {
            Ok(JsonRpcMessage::Notification(serde_json::from_value(value)?))
        } else if has_id {
            // Tolerate peers that serialize the unused member as an explicit
            // null, and `result: null` alone as a void success.
            let result = object.get("result").map(|v| !v.is_null()).unwrap_or(false);
            let error = object.get("error").map(|v| !v.is_null()).unwrap_or(false);
            let void_result = matches!(object.get("result"), Some(Value::Null));
            if result && error {
                Err(ClassifyError::Unclassifiable)
            } else if result || error || void_result {
                Ok(JsonRpcMessage::Response(serde_json::from_value(value)?))
            } else {
                Err(ClassifyError::Unclassifiable)
            }
        } else {
            Err(ClassifyError::Unclassifiable)
        }
    }

    /// Parse and classify one JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, ClassifyError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Notification(_) => None,
            JsonRpcMessage::Response(r) => Some(&r.id),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}
