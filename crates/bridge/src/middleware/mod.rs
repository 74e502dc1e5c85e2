//! Onion-composed middleware pipeline.
//!
//! The chain is constructed once at startup from the validated
//! configuration; disabled layers are omitted rather than installed as
//! no-ops. Each layer may short-circuit or decorate the context and invoke
//! the next layer; the innermost handler is always the routing terminal.

use crate::context::RequestContext;
use crate::error::BridgeError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

mod audit;
mod authn;
mod authz;
mod recovery;
mod routing;
mod telemetry;

pub use audit::AuditMiddleware;
pub use authn::{AuthMiddleware, AuthProvider, JwtValidator};
pub use authz::AuthzMiddleware;
pub use recovery::RecoveryMiddleware;
pub use routing::RoutingTerminal;
pub use telemetry::{TelemetryMiddleware, TelemetrySnapshot};

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Value, BridgeError>;
}

/// Continuation into the rest of the chain.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    terminal: &'a RoutingTerminal,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Value, BridgeError>> {
        Box::pin(async move {
            match self.layers.split_first() {
                Some((layer, rest)) => {
                    layer
                        .handle(
                            ctx,
                            Next {
                                layers: rest,
                                terminal: self.terminal,
                            },
                        )
                        .await
                }
                None => self.terminal.dispatch(ctx).await,
            }
        })
    }
}

pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
    terminal: RoutingTerminal,
}

impl MiddlewareChain {
    pub fn new(layers: Vec<Arc<dyn Middleware>>, terminal: RoutingTerminal) -> Self {
        Self { layers, terminal }
    }

    pub async fn execute(&self, ctx: &mut RequestContext) -> Result<Value, BridgeError> {
        Next {
            layers: &self.layers,
            terminal: &self.terminal,
        }
        .run(ctx)
        .await
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}
