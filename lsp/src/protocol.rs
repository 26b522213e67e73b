//! JSON-RPC envelope types and payload builders.
//!
//! The wire layer moves raw `serde_json::Value` frames; this module gives them
//! shape: incoming frames are classified into [`Message`]s, outgoing
//! responses and notifications are built here so every reply site agrees
//! on the envelope.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use qed_core::Diagnostic;

/// Error codes used on the wire.
pub mod codes {
    /// Request received before `initialize` completed.
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    /// Duplicate `initialize`, or any request after `shutdown`.
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// `$/cancelRequest` from the client.
    pub const REQUEST_CANCELLED: i64 = -32800;
    /// Document not ready, or a postponed request outlived its version.
    pub const REQUEST_STALE: i64 = -32802;
    /// Postponed requests flushed at shutdown.
    pub const SERVER_SHUTTING_DOWN: i64 = -32097;
}

/// Client-assigned request id. Opaque to the server; JSON-RPC allows both
/// integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// A response to a server-initiated request. The coordinator sends
    /// none, so these are logged and dropped.
    Response { id: RequestId },
}

/// Classify a raw frame. `None` means the frame is not a JSON-RPC message
/// (wrong shape, unparseable id).
pub fn classify(frame: Value) -> Option<Message> {
    let id = frame
        .get("id")
        .map(|v| serde_json::from_value::<RequestId>(v.clone()))
        .transpose()
        .ok()?;
    let method = frame.get("method").and_then(Value::as_str).map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    match (id, method, has_result_or_error) {
        (Some(id), Some(method), _) => Some(Message::Request { id, method, params }),
        (None, Some(method), _) => Some(Message::Notification { method, params }),
        (Some(id), None, true) => Some(Message::Response { id }),
        _ => None,
    }
}

/// An error reply body. Constructors cover the taxonomy the coordinator
/// uses; prover failures never become one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_initialized() -> Self {
        Self::new(codes::SERVER_NOT_INITIALIZED, "server not initialized")
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn cancelled_by_client() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "Cancelled by client")
    }

    #[must_use]
    pub fn document_not_ready() -> Self {
        Self::new(codes::REQUEST_STALE, "Document is not ready")
    }

    #[must_use]
    pub fn request_got_old() -> Self {
        Self::new(codes::REQUEST_STALE, "Request got old in server")
    }

    #[must_use]
    pub fn shutting_down() -> Self {
        Self::new(codes::SERVER_SHUTTING_DOWN, "Server shutting down")
    }
}

/// `window/logMessage` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error = 1,
    Warning = 2,
    Info = 3,
    Log = 4,
}

pub fn response_ok(id: &RequestId, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn response_err(id: &RequestId, error: &RpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

pub fn publish_diagnostics(uri: &Url, version: i32, diagnostics: &[Diagnostic]) -> Value {
    notification(
        "textDocument/publishDiagnostics",
        json!({ "uri": uri, "version": version, "diagnostics": diagnostics }),
    )
}

pub fn log_message(level: MessageType, message: &str) -> Value {
    notification(
        "window/logMessage",
        json!({ "type": level as u8, "message": message }),
    )
}

pub fn log_trace(message: &str) -> Value {
    notification("$/logTrace", json!({ "message": message }))
}
