//! Audit layer: one structured event at request start, one with the
//! post-call outcome.

use super::{Middleware, Next};
use crate::audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink, AuditSource, AuditTarget};
use crate::context::RequestContext;
use crate::error::{BridgeError, ErrorKind};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct AuditMiddleware {
    sink: Arc<dyn AuditSink>,
}

impl AuditMiddleware {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    fn source(ctx: &RequestContext) -> AuditSource {
        AuditSource {
            session_id: ctx.session_id.clone(),
            client_addr: ctx.client_addr.clone(),
            subject: Some(ctx.identity.subject.clone()),
        }
    }

    fn target(ctx: &RequestContext) -> AuditTarget {
        AuditTarget {
            backend: ctx.backend.clone(),
            method: Some(ctx.method.as_str().to_string()),
            exposed_name: Some(ctx.capability.clone()),
            original_name: ctx.original_name.clone(),
        }
    }
}

#[async_trait]
impl Middleware for AuditMiddleware {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        // Start event: no outcome yet. The completion event below is the one
        // record carrying a post-call outcome.
        self.sink.record(
            AuditEvent::new(AuditKind::McpOperation)
                .source(Self::source(ctx))
                .target(Self::target(ctx))
                .meta(serde_json::json!({ "requestId": ctx.request_id, "stage": "start" })),
        );

        let result = next.run(ctx).await;

        let outcome = match &result {
            Ok(_) => AuditOutcome {
                status: "ok".to_string(),
                latency_ms: Some(ctx.elapsed_ms()),
                error_kind: None,
                error_type: None,
            },
            Err(err) => AuditOutcome {
                status: if err.kind() == ErrorKind::Cancelled {
                    "cancelled".to_string()
                } else {
                    "error".to_string()
                },
                latency_ms: Some(ctx.elapsed_ms()),
                error_kind: Some(err.kind().as_str().to_string()),
                error_type: ctx.error_detail.clone(),
            },
        };

        self.sink.record(
            AuditEvent::new(AuditKind::McpOperation)
                .source(Self::source(ctx))
                .target(Self::target(ctx))
                .outcome(outcome)
                .meta(serde_json::json!({ "requestId": ctx.request_id, "stage": "complete" })),
        );

        result
    }
}
