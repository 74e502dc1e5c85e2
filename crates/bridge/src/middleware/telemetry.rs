//! Telemetry layer: request spans plus in-process counters.
//!
//! When the layer is disabled in configuration it is omitted from the chain
//! entirely, so the disabled cost is zero.

use super::{Middleware, Next};
use crate::context::{McpMethod, RequestContext};
use crate::error::BridgeError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Instrument as _;

#[derive(Default)]
struct MethodCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    total_latency_ms: AtomicU64,
}

#[derive(Default)]
pub struct TelemetryMiddleware {
    call_tool: MethodCounters,
    read_resource: MethodCounters,
    get_prompt: MethodCounters,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub call_tool: MethodSnapshot,
    pub read_resource: MethodSnapshot,
    pub get_prompt: MethodSnapshot,
}

impl TelemetryMiddleware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counters(&self, method: McpMethod) -> &MethodCounters {
        match method {
            McpMethod::CallTool => &self.call_tool,
            McpMethod::ReadResource => &self.read_resource,
            McpMethod::GetPrompt => &self.get_prompt,
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let snap = |c: &MethodCounters| MethodSnapshot {
            requests: c.requests.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            total_latency_ms: c.total_latency_ms.load(Ordering::Relaxed),
        };
        TelemetrySnapshot {
            call_tool: snap(&self.call_tool),
            read_resource: snap(&self.read_resource),
            get_prompt: snap(&self.get_prompt),
        }
    }
}

#[async_trait]
impl Middleware for TelemetryMiddleware {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        let span = tracing::info_span!(
            "mcp.request",
            otel.name = %format!("mcp.{}.{}", ctx.method, ctx.capability),
            method = %ctx.method,
            capability = %ctx.capability,
            backend = tracing::field::Empty,
            success = tracing::field::Empty,
        );

        let method = ctx.method;
        let started = ctx.started;
        let result = next.run(ctx).instrument(span.clone()).await;

        if let Some(backend) = &ctx.backend {
            span.record("backend", backend.as_str());
        }
        span.record("success", result.is_ok());

        let counters = self.counters(method);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        counters.total_latency_ms.fetch_add(
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        result
    }
}
