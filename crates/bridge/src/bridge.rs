//! Top-level assembly: builds the middleware chain and component graph from
//! a validated configuration and exposes the dispatch + observation surface
//! the transports and management API consume.

use crate::audit::{AuditEvent, AuditSink, FileAuditSink, MemoryAuditSink, NoopAuditSink};
use crate::authz::PolicyEngine;
use crate::capability::CapabilityKind;
use crate::config::BridgeConfig;
use crate::context::RequestContext;
use crate::error::BridgeError;
use crate::health::HealthMonitor;
use crate::manager::{ClientManager, ReconnectReport, SessionConnector, TransportConnector};
use crate::middleware::{
    AuditMiddleware, AuthMiddleware, AuthProvider, AuthzMiddleware, Middleware, MiddlewareChain,
    RecoveryMiddleware, RoutingTerminal, TelemetryMiddleware, TelemetrySnapshot,
};
use crate::registry::{CapabilityRegistry, ListFilter, RouteMaps};
use crate::reload::{ReloadCoordinator, ReloadReport};
use crate::sessions::SessionTracker;
use crate::status::BackendStatusRecord;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct Bridge {
    registry: Arc<CapabilityRegistry>,
    manager: Arc<ClientManager>,
    health: Arc<HealthMonitor>,
    chain: MiddlewareChain,
    audit: Arc<dyn AuditSink>,
    auth_provider: Arc<AuthProvider>,
    telemetry: Arc<TelemetryMiddleware>,
    tracker: Arc<SessionTracker>,
    reload: ReloadCoordinator,
    shutdown: CancellationToken,
    started_at: Instant,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub route_map_version: u64,
    pub upstream_sessions: usize,
    pub audit_events_dropped: u64,
    pub telemetry: TelemetrySnapshot,
    pub backends: Vec<BackendStatusRecord>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteView {
    pub kind: CapabilityKind,
    pub exposed_name: String,
    pub backend: String,
    pub original_name: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesSnapshot {
    pub version: u64,
    pub capabilities: Vec<crate::capability::CapabilityRecord>,
    pub routes: Vec<RouteView>,
}

impl Bridge {
    /// Assemble the component graph. Must run inside a Tokio runtime: the
    /// audit sink and background loops spawn tasks.
    pub fn new(config: BridgeConfig, shutdown: CancellationToken) -> Result<Arc<Self>, BridgeError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| BridgeError::Internal(format!("build http client: {e}")))?;
        let connector = TransportConnector::new(http);
        Self::with_connector(config, shutdown, connector)
    }

    /// Assemble with a custom session connector. Used by tests and by
    /// embedders that provide in-process backends.
    pub fn with_connector(
        config: BridgeConfig,
        shutdown: CancellationToken,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Arc<Self>, BridgeError> {
        crate::config::validate(&config).map_err(BridgeError::InvalidRequest)?;

        let audit: Arc<dyn AuditSink> = if !config.audit.enabled {
            Arc::new(NoopAuditSink)
        } else if let Some(path) = &config.audit.file {
            FileAuditSink::new(
                path,
                config.audit.max_size,
                config.audit.backup_count,
                shutdown.clone(),
            )
        } else {
            Arc::new(MemoryAuditSink::new())
        };

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| BridgeError::Internal(format!("build http client: {e}")))?;

        let registry = Arc::new(CapabilityRegistry::new(audit.clone()));
        let manager = ClientManager::new(
            &config,
            registry.clone(),
            audit.clone(),
            connector,
            shutdown.clone(),
        );
        let health = HealthMonitor::new(manager.clone(), &config.health);
        let tracker = SessionTracker::new(Duration::from_secs(config.limits.session_ttl_secs.max(1)));

        let telemetry = TelemetryMiddleware::new();
        let mut layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(RecoveryMiddleware)];

        let provider = Arc::new(
            AuthProvider::from_config(&config.incoming_auth, http.clone())
                .map_err(BridgeError::InvalidRequest)?,
        );
        if !matches!(provider.as_ref(), AuthProvider::Anonymous) {
            layers.push(Arc::new(AuthMiddleware::new(provider.clone(), audit.clone())));
        }

        if config.authorization.enabled {
            let engine =
                PolicyEngine::compile(&config.authorization).map_err(BridgeError::InvalidRequest)?;
            layers.push(Arc::new(AuthzMiddleware::new(engine, audit.clone())));
        }

        layers.push(telemetry.clone());

        if config.audit.enabled {
            layers.push(Arc::new(AuditMiddleware::new(audit.clone())));
        }

        let terminal = RoutingTerminal::new(registry.clone(), manager.clone(), health.clone());
        let chain = MiddlewareChain::new(layers, terminal);

        let reload = ReloadCoordinator::new(manager.clone(), audit.clone(), Arc::new(config));

        Ok(Arc::new(Self {
            registry,
            manager,
            health,
            chain,
            audit,
            auth_provider: provider,
            telemetry,
            tracker,
            reload,
            shutdown,
            started_at: Instant::now(),
        }))
    }

    /// Connect every backend and start the background loops.
    pub async fn start(self: &Arc<Self>) {
        self.manager.start_all().await;
        self.health.spawn(self.shutdown.clone());
        self.tracker.spawn_sweep(self.shutdown.clone());
    }

    /// Graceful teardown within the configured shutdown deadline.
    pub async fn stop(&self) {
        self.manager.stop_all().await;
    }

    /// Run one inbound MCP call through the middleware pipeline.
    pub async fn dispatch(&self, ctx: &mut RequestContext) -> Result<Value, BridgeError> {
        self.chain.execute(ctx).await
    }

    /// Authenticate a bearer credential outside the call pipeline. The
    /// transports use this for `initialize` and the list methods, which do
    /// not pass through the middleware chain. Rejections are audited the
    /// same way the authentication middleware audits them.
    pub async fn authenticate(
        &self,
        bearer: Option<&str>,
        session_id: Option<&str>,
        client_addr: Option<&str>,
    ) -> Result<crate::context::UserIdentity, BridgeError> {
        match self.auth_provider.authenticate(bearer).await {
            Ok(identity) => Ok(identity),
            Err(reason) => {
                self.audit.record(
                    crate::audit::AuditEvent::new(crate::audit::AuditKind::AuthFailure)
                        .source(crate::audit::AuditSource {
                            session_id: session_id.map(str::to_string),
                            client_addr: client_addr.map(str::to_string),
                            subject: None,
                        })
                        .outcome(crate::audit::AuditOutcome {
                            status: "unauthenticated".to_string(),
                            latency_ms: None,
                            error_kind: Some("unauthenticated".to_string()),
                            error_type: None,
                        }),
                );
                Err(BridgeError::Unauthenticated(reason))
            }
        }
    }

    // ── Observation surface ───────────────────────────────────────────

    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            route_map_version: self.registry.snapshot().version,
            upstream_sessions: self.tracker.len(),
            audit_events_dropped: self.audit.dropped(),
            telemetry: self.telemetry.snapshot(),
            backends: self.manager.snapshot(),
        }
    }

    pub fn capabilities_snapshot(&self, filter: &ListFilter) -> CapabilitiesSnapshot {
        let snapshot = self.registry.snapshot();
        let mut routes = Vec::new();
        for kind in CapabilityKind::ALL {
            for (exposed, target) in snapshot.map_for(kind) {
                routes.push(RouteView {
                    kind,
                    exposed_name: exposed.clone(),
                    backend: target.backend.clone(),
                    original_name: target.original_name.clone(),
                });
            }
        }
        routes.sort_by(|a, b| {
            (a.kind.as_str(), a.exposed_name.as_str()).cmp(&(b.kind.as_str(), b.exposed_name.as_str()))
        });
        CapabilitiesSnapshot {
            version: snapshot.version,
            capabilities: self.registry.list(filter),
            routes,
        }
    }

    pub fn events_tail(&self, since: Option<DateTime<Utc>>, max: usize) -> Vec<AuditEvent> {
        self.audit.recent(since, max)
    }

    pub async fn reload(&self, new_config: BridgeConfig) -> Result<ReloadReport, BridgeError> {
        crate::config::validate(&new_config).map_err(BridgeError::InvalidRequest)?;
        self.reload.reload(new_config).await
    }

    pub async fn reconnect(&self, name: &str) -> Result<ReconnectReport, BridgeError> {
        self.health.reset(name);
        self.manager.reconnect(name).await
    }

    // ── Accessors for the transport layer ─────────────────────────────

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn current_snapshot(&self) -> Arc<RouteMaps> {
        self.registry.snapshot()
    }

    pub fn config(&self) -> Arc<BridgeConfig> {
        self.reload.current_config()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
