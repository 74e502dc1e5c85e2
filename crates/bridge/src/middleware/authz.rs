//! Authorization layer: role-vs-resource policy evaluation.

use super::{Middleware, Next};
use crate::audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink, AuditSource, AuditTarget};
use crate::authz::PolicyEngine;
use crate::config::PolicyEffect;
use crate::context::RequestContext;
use crate::error::BridgeError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct AuthzMiddleware {
    engine: PolicyEngine,
    audit: Arc<dyn AuditSink>,
}

impl AuthzMiddleware {
    pub fn new(engine: PolicyEngine, audit: Arc<dyn AuditSink>) -> Self {
        Self { engine, audit }
    }
}

#[async_trait]
impl Middleware for AuthzMiddleware {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        let kind = ctx.method.kind();
        let effect = self
            .engine
            .evaluate(&ctx.identity.roles, kind, &ctx.capability);
        if effect == PolicyEffect::Allow {
            return next.run(ctx).await;
        }

        tracing::warn!(
            request_id = %ctx.request_id,
            subject = %ctx.identity.subject,
            resource = %format!("{kind}:{}", ctx.capability),
            "authorization denied"
        );
        self.audit.record(
            AuditEvent::new(AuditKind::AuthFailure)
                .source(AuditSource {
                    session_id: ctx.session_id.clone(),
                    client_addr: ctx.client_addr.clone(),
                    subject: Some(ctx.identity.subject.clone()),
                })
                .target(AuditTarget {
                    method: Some(ctx.method.as_str().to_string()),
                    exposed_name: Some(ctx.capability.clone()),
                    ..AuditTarget::default()
                })
                .outcome(AuditOutcome {
                    status: "forbidden".to_string(),
                    latency_ms: Some(ctx.elapsed_ms()),
                    error_kind: Some("forbidden".to_string()),
                    error_type: None,
                }),
        );
        Err(BridgeError::Forbidden(format!(
            "access to {kind}:{} denied",
            ctx.capability
        )))
    }
}
