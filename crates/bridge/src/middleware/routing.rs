//! Routing terminal: the innermost handler.
//!
//! Resolves the exposed capability name against the published route map,
//! obtains the live backend session from the client manager, restores the
//! original name, and forwards the call with the context deadline.

use crate::context::{McpMethod, RequestContext};
use crate::error::BridgeError;
use crate::health::HealthMonitor;
use crate::manager::{ClientManager, reason};
use crate::registry::CapabilityRegistry;
use crate::session::SessionError;
use serde_json::Value;
use std::sync::Arc;

pub struct RoutingTerminal {
    registry: Arc<CapabilityRegistry>,
    manager: Arc<ClientManager>,
    health: Arc<HealthMonitor>,
}

impl RoutingTerminal {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        manager: Arc<ClientManager>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            registry,
            manager,
            health,
        }
    }

    pub async fn dispatch(&self, ctx: &mut RequestContext) -> Result<Value, BridgeError> {
        if ctx.capability.is_empty() {
            return Err(BridgeError::InvalidRequest(
                "capability name must be non-empty".to_string(),
            ));
        }

        let kind = ctx.method.kind();
        let Some(target) = self.registry.resolve(kind, &ctx.capability) else {
            return Err(BridgeError::CapabilityNotFound(format!(
                "{kind}:{}",
                ctx.capability
            )));
        };
        ctx.backend = Some(target.backend.clone());
        ctx.original_name = Some(target.original_name.clone());

        let Some(session) = self.manager.session(&target.backend) else {
            // A stale route: the backend left Ready/Degraded between publish
            // and lookup. Kick a probe so the monitor converges quickly.
            let health = self.health.clone();
            let backend = target.backend.clone();
            tokio::spawn(async move { health.probe_one(&backend).await });
            return Err(BridgeError::BackendUnavailable {
                backend: target.backend,
                reason: "backend is not in a routable phase".to_string(),
            });
        };

        // Per-backend call timeout caps the transport-imposed deadline.
        let deadline = match self.manager.descriptor(&target.backend) {
            Some(desc) => ctx
                .deadline
                .min(tokio::time::Instant::now() + desc.timeouts.call()),
            None => ctx.deadline,
        };

        let params = build_params(ctx.method, &target.original_name, ctx.arguments.clone());
        let call = session.request(ctx.method.wire_method(), Some(params), deadline);
        let result = tokio::select! {
            res = call => res,
            () = ctx.cancel.cancelled() => {
                // Caller abandoned the request; the session's late-reply
                // cleanup drops the outstanding entry when the backend
                // eventually answers.
                ctx.error_detail = Some("cancelled by caller".to_string());
                return Err(BridgeError::Cancelled);
            }
        };

        match result {
            Ok(v) => Ok(v),
            Err(err) => {
                ctx.error_detail = Some(err.to_string());
                if err.is_fatal() {
                    // Transport loss fails the backend; reconnection stays
                    // explicit via the management surface.
                    let manager = self.manager.clone();
                    let backend = target.backend.clone();
                    let detail = err.to_string();
                    tokio::spawn(async move {
                        manager
                            .fail_backend(&backend, reason::TRANSPORT_FAILURE, &detail)
                            .await;
                    });
                }
                Err(classify(err, &target.backend))
            }
        }
    }
}

fn build_params(method: McpMethod, original_name: &str, arguments: Option<Value>) -> Value {
    match method {
        McpMethod::CallTool => serde_json::json!({
            "name": original_name,
            "arguments": arguments.unwrap_or(Value::Object(serde_json::Map::new())),
        }),
        McpMethod::ReadResource => serde_json::json!({ "uri": original_name }),
        McpMethod::GetPrompt => {
            let mut params = serde_json::Map::new();
            params.insert("name".to_string(), Value::String(original_name.to_string()));
            if let Some(args) = arguments {
                params.insert("arguments".to_string(), args);
            }
            Value::Object(params)
        }
    }
}

fn classify(err: SessionError, backend: &str) -> BridgeError {
    err.into_bridge(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_tool_params_restore_original_name() {
        let p = build_params(
            McpMethod::CallTool,
            "search",
            Some(serde_json::json!({"q": "rust"})),
        );
        assert_eq!(p["name"], "search");
        assert_eq!(p["arguments"]["q"], "rust");
    }

    #[test]
    fn call_tool_params_default_to_empty_arguments() {
        let p = build_params(McpMethod::CallTool, "search", None);
        assert!(p["arguments"].is_object());
    }

    #[test]
    fn read_resource_params_use_uri() {
        let p = build_params(McpMethod::ReadResource, "file:///readme", None);
        assert_eq!(p["uri"], "file:///readme");
    }

    #[test]
    fn get_prompt_params_omit_missing_arguments() {
        let p = build_params(McpMethod::GetPrompt, "greet", None);
        assert_eq!(p["name"], "greet");
        assert!(p.get("arguments").is_none());
    }
}
