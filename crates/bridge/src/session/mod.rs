//! Backend sessions: one live connection object per backend.
//!
//! Three transports implement the same contract. Each session owns its I/O
//! streams, a request-id allocator, an outstanding-request map, and a cap on
//! concurrent in-flight calls. Sessions are created by the client manager on
//! `Initializing` and destroyed on `Failed`/`ShuttingDown`.

use crate::capability::{CapabilityKind, RawCapability};
use crate::config::{BackendConfig, TransportConfig};
use crate::error::BridgeError;
use async_trait::async_trait;
use manifold_wire as wire;
use manifold_wire::types::{
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub mod auth;
mod rpc;
mod sse;
mod stdio;
mod streamable;

pub use auth::{OutgoingAuth, TokenClient, TokenFetcher};
pub use rpc::{CallGate, PendingRequest, RequestTracker};
pub use sse::SseSession;
pub use stdio::StdioSession;
pub use streamable::StreamableHttpSession;

const CLIENT_NAME: &str = "manifold-gateway";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Session-level failure classification. The routing terminal converts these
/// into [`BridgeError`] values with the backend name attached.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("session at capacity")]
    Overloaded,

    #[error("transport failure: {0}")]
    Transport(String),

    /// Structured JSON-RPC error returned by the backend.
    #[error("backend error {code}: {message}")]
    Backend {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn into_bridge(self, backend: &str) -> BridgeError {
        match self {
            Self::Timeout { elapsed_ms } => BridgeError::Timeout {
                backend: backend.to_string(),
                elapsed_ms,
            },
            Self::Overloaded => BridgeError::BackendOverloaded {
                backend: backend.to_string(),
            },
            Self::Transport(reason) => BridgeError::TransportFailure {
                backend: backend.to_string(),
                reason,
            },
            Self::Backend {
                code,
                message,
                data,
            } => BridgeError::Backend {
                backend: backend.to_string(),
                code,
                message: crate::error::sanitize_message(&message),
                data,
            },
            Self::InvalidResponse(reason) => BridgeError::InvalidResponse {
                backend: backend.to_string(),
                reason,
            },
            Self::Closed => BridgeError::TransportFailure {
                backend: backend.to_string(),
                reason: "session closed".to_string(),
            },
        }
    }

    /// Failures that mean the underlying connection is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed)
    }
}

/// The per-transport contract. `request`/`notify`/`close` are the transport
/// primitives; everything else is protocol shared across transports.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Dispatch one JSON-RPC request and await the correlated response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, SessionError>;

    /// Fire a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError>;

    /// Release underlying I/O resources. Idempotent.
    async fn close(&self);

    /// Protocol handshake. Must complete within the init timeout baked into
    /// `deadline` or the session is failed by the manager.
    async fn initialize(&self, deadline: Instant) -> Result<InitializeResult, SessionError> {
        let params = InitializeParams::new(CLIENT_NAME, CLIENT_VERSION);
        let raw = self
            .request(
                "initialize",
                Some(serde_json::to_value(&params).map_err(invalid)?),
                deadline,
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(raw).map_err(invalid)?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Fetch the raw catalog for one capability kind.
    async fn list_capabilities(
        &self,
        kind: CapabilityKind,
        deadline: Instant,
    ) -> Result<Vec<RawCapability>, SessionError> {
        let method = match kind {
            CapabilityKind::Tool => "tools/list",
            CapabilityKind::Resource => "resources/list",
            CapabilityKind::Prompt => "prompts/list",
        };
        let raw = self.request(method, None, deadline).await?;
        match kind {
            CapabilityKind::Tool => {
                let r: ListToolsResult = serde_json::from_value(raw).map_err(invalid)?;
                Ok(r.tools.into_iter().map(RawCapability::from_tool).collect())
            }
            CapabilityKind::Resource => {
                let r: ListResourcesResult = serde_json::from_value(raw).map_err(invalid)?;
                Ok(r.resources
                    .into_iter()
                    .map(RawCapability::from_resource)
                    .collect())
            }
            CapabilityKind::Prompt => {
                let r: ListPromptsResult = serde_json::from_value(raw).map_err(invalid)?;
                Ok(r.prompts
                    .into_iter()
                    .map(RawCapability::from_prompt)
                    .collect())
            }
        }
    }

    /// Cheap liveness probe.
    async fn ping(&self, deadline: Instant) -> Result<(), SessionError> {
        self.request("ping", None, deadline).await.map(|_| ())
    }
}

fn invalid(e: impl std::fmt::Display) -> SessionError {
    SessionError::InvalidResponse(e.to_string())
}

/// Runtime knobs shared by all transports, derived from config.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_outstanding: usize,
    pub sse_startup: Duration,
}

/// Build and connect a session for a descriptor.
///
/// For stdio this spawns the child process and its reader tasks; for SSE it
/// opens the event stream and waits for the endpoint announcement; for
/// streamable HTTP it only prepares the client (the handshake happens on
/// `initialize`).
pub async fn connect(
    descriptor: &BackendConfig,
    limits: &SessionLimits,
    http: reqwest::Client,
    shutdown: CancellationToken,
) -> Result<Arc<dyn BackendSession>, SessionError> {
    let outgoing = OutgoingAuth::from_config(descriptor.auth.as_ref(), http.clone());
    match &descriptor.transport {
        TransportConfig::Stdio(connect) => {
            let session =
                StdioSession::spawn(&descriptor.name, connect, limits.max_outstanding, shutdown)?;
            Ok(session)
        }
        TransportConfig::Sse(connect) => {
            let session = SseSession::connect(
                &descriptor.name,
                connect,
                outgoing,
                http,
                limits.max_outstanding,
                limits.sse_startup,
                shutdown,
            )
            .await?;
            Ok(session)
        }
        TransportConfig::StreamableHttp(connect) => Ok(StreamableHttpSession::new(
            &descriptor.name,
            connect,
            outgoing,
            http,
            limits.max_outstanding,
        )),
    }
}

/// Helper shared by HTTP-based transports: turn a decoded JSON-RPC message
/// into the result of the request with `id`.
pub(crate) fn take_result_for(
    msg: wire::Message,
    id: &wire::RequestId,
) -> Option<Result<Value, SessionError>> {
    match msg {
        wire::Message::Response(resp) if &resp.id == id => Some(rpc::response_into_result(resp)),
        wire::Message::Response(_) | wire::Message::Request(_) | wire::Message::Notification(_) => {
            None
        }
    }
}
