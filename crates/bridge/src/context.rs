//! Per-request context threaded through the middleware chain.

use crate::capability::CapabilityKind;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The three MCP call methods the bridge routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMethod {
    CallTool,
    ReadResource,
    GetPrompt,
}

impl McpMethod {
    pub fn kind(self) -> CapabilityKind {
        match self {
            Self::CallTool => CapabilityKind::Tool,
            Self::ReadResource => CapabilityKind::Resource,
            Self::GetPrompt => CapabilityKind::Prompt,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallTool => "call_tool",
            Self::ReadResource => "read_resource",
            Self::GetPrompt => "get_prompt",
        }
    }

    /// Method name on the backend wire.
    pub fn wire_method(self) -> &'static str {
        match self {
            Self::CallTool => "tools/call",
            Self::ReadResource => "resources/read",
            Self::GetPrompt => "prompts/get",
        }
    }
}

impl std::fmt::Display for McpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller. The anonymous identity is a distinguished value
/// with an empty role set.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub subject: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub roles: Vec<String>,
    pub provider: &'static str,
    pub claims: Value,
}

impl UserIdentity {
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            email: None,
            display_name: None,
            roles: Vec::new(),
            provider: "anonymous",
            claims: Value::Null,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.provider == "anonymous"
    }
}

/// One inbound MCP call. Created by the transport layer, decorated by
/// middleware, dropped after the outermost layer returns.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    /// Exposed capability name as requested by the client.
    pub capability: String,
    pub method: McpMethod,
    pub arguments: Option<Value>,
    /// Upstream session id, when the transport supplied one.
    pub session_id: Option<String>,
    pub client_addr: Option<String>,
    /// Raw bearer credential extracted by the transport.
    pub bearer: Option<String>,
    pub deadline: Instant,
    /// Cancelled when the caller abandons the request (client-sent
    /// `notifications/cancelled` or transport disconnect).
    pub cancel: CancellationToken,
    pub identity: UserIdentity,
    /// Populated by the routing terminal once the route resolves.
    pub backend: Option<String>,
    pub original_name: Option<String>,
    /// Metadata bag middleware may augment.
    pub metadata: serde_json::Map<String, Value>,
    pub started: Instant,
    /// Full unsanitized failure detail, preserved for the audit trail while
    /// the wire message is scrubbed.
    pub error_detail: Option<String>,
}

impl RequestContext {
    pub fn new(method: McpMethod, capability: impl Into<String>, deadline: Instant) -> Self {
        Self {
            request_id: Uuid::new_v4().simple().to_string(),
            capability: capability.into(),
            method,
            arguments: None,
            session_id: None,
            client_addr: None,
            bearer: None,
            deadline,
            cancel: CancellationToken::new(),
            identity: UserIdentity::anonymous(),
            backend: None,
            original_name: None,
            metadata: serde_json::Map::new(),
            started: Instant::now(),
            error_detail: None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
