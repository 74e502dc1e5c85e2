//! Error taxonomy for the bridge core.
//!
//! Every failure that can surface to a client is a value of [`BridgeError`];
//! only the recovery middleware converts one into a wire envelope, and it
//! does so exactly once. Backend-originated structured errors pass through
//! with their original code but a sanitized message.

use manifold_wire as wire;
use serde_json::Value;
use thiserror::Error;

/// Stable machine-readable kind tags, used in audit records and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    CapabilityNotFound,
    Unauthenticated,
    Forbidden,
    BackendUnavailable,
    BackendOverloaded,
    Timeout,
    BackendError,
    TransportFailure,
    InvalidResponse,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::CapabilityNotFound => "capability_not_found",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::BackendUnavailable => "backend_unavailable",
            Self::BackendOverloaded => "backend_overloaded",
            Self::Timeout => "timeout",
            Self::BackendError => "backend_error",
            Self::TransportFailure => "transport_failure",
            Self::InvalidResponse => "invalid_response",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("backend '{backend}' overloaded")]
    BackendOverloaded { backend: String },

    #[error("call to '{backend}' timed out after {elapsed_ms}ms")]
    Timeout { backend: String, elapsed_ms: u64 },

    /// Structured error payload returned by the backend itself.
    #[error("backend error from '{backend}': {message}")]
    Backend {
        backend: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("transport failure on '{backend}': {reason}")]
    TransportFailure { backend: String, reason: String },

    #[error("invalid response from '{backend}': {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::CapabilityNotFound(_) => ErrorKind::CapabilityNotFound,
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::BackendOverloaded { .. } => ErrorKind::BackendOverloaded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Backend { .. } => ErrorKind::BackendError,
            Self::TransportFailure { .. } => ErrorKind::TransportFailure,
            Self::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// JSON-RPC error code for the wire envelope.
    ///
    /// Backend errors pass their original code through.
    pub fn wire_code(&self) -> i64 {
        match self {
            Self::InvalidRequest(_) => wire::CODE_INVALID_REQUEST,
            Self::CapabilityNotFound(_) => wire::CODE_METHOD_NOT_FOUND,
            Self::Unauthenticated(_) => wire::CODE_UNAUTHENTICATED,
            Self::Forbidden(_) => wire::CODE_FORBIDDEN,
            Self::BackendUnavailable { .. } => wire::CODE_BACKEND_UNAVAILABLE,
            Self::BackendOverloaded { .. } => wire::CODE_BACKEND_OVERLOADED,
            Self::Timeout { .. } => wire::CODE_TIMEOUT,
            Self::Backend { code, .. } => *code,
            Self::TransportFailure { .. } => wire::CODE_TRANSPORT_FAILURE,
            Self::InvalidResponse { .. } => wire::CODE_INVALID_RESPONSE,
            Self::Cancelled => wire::CODE_CANCELLED,
            Self::Internal(_) => wire::CODE_INTERNAL_ERROR,
        }
    }

    /// Whether a client may reasonably retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::BackendOverloaded { .. })
    }
}

/// Strip absolute filesystem paths and process ids from a message destined
/// for the wire. The full text still reaches the audit trail.
pub fn sanitize_message(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    for (i, word) in msg.split(' ').enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let trimmed = word.trim_matches(|c: char| matches!(c, '\'' | '"' | '(' | ')' | ':' | ','));
        if trimmed.starts_with('/') && trimmed.len() > 1 {
            out.push_str("<path>");
        } else if trimmed.starts_with("pid=") {
            out.push_str("pid=<redacted>");
        } else {
            out.push_str(word);
        }
    }
    out
}
