//! JSON-RPC 2.0 envelope and MCP payload types.
//!
//! Both sides of the gateway speak the same wire shapes: the northbound MCP
//! endpoints parse client messages into these types, and backend sessions
//! serialize them onto stdio/SSE/streamable-HTTP transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod sse;
pub mod types;

pub use sse::{SseDecoder, SseEvent};

pub const JSONRPC_VERSION: &str = "2.0";

/// The MCP protocol revision this gateway negotiates.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// JSON-RPC error codes used on the wire. The -32000..-32099 band carries
// gateway-specific conditions; -32800 is the cancellation code from the MCP
// spec.
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;
pub const CODE_UNAUTHENTICATED: i64 = -32001;
pub const CODE_FORBIDDEN: i64 = -32002;
pub const CODE_BACKEND_UNAVAILABLE: i64 = -32003;
pub const CODE_BACKEND_OVERLOADED: i64 = -32004;
pub const CODE_TIMEOUT: i64 = -32005;
pub const CODE_TRANSPORT_FAILURE: i64 = -32006;
pub const CODE_INVALID_RESPONSE: i64 = -32007;
pub const CODE_CANCELLED: i64 = -32800;

/// A JSON-RPC request id. MCP allows both numbers and strings; the gateway
/// allocates numeric ids for its own southbound requests but must round-trip
/// whatever a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Any inbound JSON-RPC message.
///
/// Order matters for untagged deserialization: a `Request` carries both `id`
/// and `method`, a `Response` carries `id` plus `result`/`error`, and a
/// `Notification` only a `method`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn from_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
