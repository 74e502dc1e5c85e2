//! Outermost layer: converts residual failures into clean error values.
//!
//! Inner layers signal failure structurally; this layer is the only place a
//! panic or an unsanitized internal message is turned into the single
//! user-visible error. The full detail is preserved on the context for the
//! audit trail.

use super::{Middleware, Next};
use crate::context::RequestContext;
use crate::error::{BridgeError, sanitize_message};
use async_trait::async_trait;
use futures::FutureExt as _;
use serde_json::Value;
use std::panic::AssertUnwindSafe;

pub struct RecoveryMiddleware;

#[async_trait]
impl Middleware for RecoveryMiddleware {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        let result = AssertUnwindSafe(next.run(ctx)).catch_unwind().await;

        let result = match result {
            Ok(inner) => inner,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!(request_id = %ctx.request_id, detail, "panic in request pipeline");
                ctx.error_detail = Some(detail.to_string());
                return Err(BridgeError::Internal(
                    "internal error while handling request".to_string(),
                ));
            }
        };

        match result {
            Ok(v) => Ok(v),
            Err(err) => {
                // Keep the unscrubbed text for audit, scrub what goes to
                // the wire.
                if ctx.error_detail.is_none() {
                    ctx.error_detail = Some(err.to_string());
                }
                Err(match err {
                    BridgeError::Internal(msg) => BridgeError::Internal(sanitize_message(&msg)),
                    BridgeError::TransportFailure { backend, reason } => {
                        BridgeError::TransportFailure {
                            backend,
                            reason: sanitize_message(&reason),
                        }
                    }
                    other => other,
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
