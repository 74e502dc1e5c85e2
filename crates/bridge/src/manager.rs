//! Client manager: owns backend sessions and drives the lifecycle state
//! machine.
//!
//! Every phase transition for a backend is serialized by that backend's slot
//! lock; global operations take slots one backend at a time in deterministic
//! (insertion) order. A `Failed` backend is never revived in place;
//! reconnect tears the session down and walks a fresh lifecycle.

use crate::audit::{AuditEvent, AuditKind, AuditSink, AuditTarget};
use crate::capability::{CapabilityKind, CapabilityRecord};
use crate::config::{BackendConfig, BridgeConfig, ConflictResolutionConfig};
use crate::error::BridgeError;
use crate::filter;
use crate::registry::CapabilityRegistry;
use crate::session::{self, BackendSession, SessionError, SessionLimits};
use crate::status::{
    BackendPhase, BackendStatusRecord, CapabilityCounts, CONDITION_AVAILABLE, CONDITION_HEALTHY,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Builds a live session for a descriptor. The production connector opens
/// the real transport; tests substitute in-memory backends.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &BackendConfig,
        limits: &SessionLimits,
        shutdown: CancellationToken,
    ) -> Result<Arc<dyn BackendSession>, SessionError>;
}

pub struct TransportConnector {
    http: reqwest::Client,
}

impl TransportConnector {
    pub fn new(http: reqwest::Client) -> Arc<Self> {
        Arc::new(Self { http })
    }
}

#[async_trait]
impl SessionConnector for TransportConnector {
    async fn connect(
        &self,
        descriptor: &BackendConfig,
        limits: &SessionLimits,
        shutdown: CancellationToken,
    ) -> Result<Arc<dyn BackendSession>, SessionError> {
        session::connect(descriptor, limits, self.http.clone(), shutdown).await
    }
}

/// Reason codes attached to phase-change conditions and audit events.
pub mod reason {
    pub const STARTED: &str = "started";
    pub const INIT_FAILED: &str = "init_failed";
    pub const INIT_TIMEOUT: &str = "init_timeout";
    pub const CAP_FETCH_FAILED: &str = "cap_fetch_failed";
    pub const HEALTH_FAILED: &str = "health_failed";
    pub const HEALTH_DEGRADED: &str = "health_degraded";
    pub const HEALTH_RECOVERED: &str = "health_recovered";
    pub const TRANSPORT_FAILURE: &str = "transport_failure";
    pub const SHUTDOWN: &str = "shutdown";
    pub const RECONNECT: &str = "reconnect";
    pub const RELOAD: &str = "reload";
}

struct BackendRuntime {
    descriptor: Arc<BackendConfig>,
    status: RwLock<BackendStatusRecord>,
    /// Live session for the routing hot path. Written only with the slot
    /// lock held.
    session: RwLock<Option<Arc<dyn BackendSession>>>,
    /// Normalized (filtered + renamed) catalog from the last successful
    /// fetch. Written only with the slot lock held.
    catalog: RwLock<Vec<CapabilityRecord>>,
    /// Serializes all transitions for this backend.
    slot: tokio::sync::Mutex<()>,
    /// Bumped when a connect cycle completes; used to coalesce reconnects.
    epoch: AtomicU64,
}

impl BackendRuntime {
    fn new(descriptor: BackendConfig) -> Arc<Self> {
        let status = BackendStatusRecord::new(
            &descriptor.name,
            &descriptor.group,
            descriptor.transport.kind(),
        );
        Arc::new(Self {
            descriptor: Arc::new(descriptor),
            status: RwLock::new(status),
            session: RwLock::new(None),
            catalog: RwLock::new(Vec::new()),
            slot: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
        })
    }

    fn phase(&self) -> BackendPhase {
        self.status.read().phase
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectReport {
    pub backend: String,
    /// False when the call coalesced into a cycle another caller ran.
    pub reconnected: bool,
    pub phase: BackendPhase,
}

pub struct ClientManager {
    backends: RwLock<Vec<Arc<BackendRuntime>>>,
    registry: Arc<CapabilityRegistry>,
    audit: Arc<dyn AuditSink>,
    connector: Arc<dyn SessionConnector>,
    conflict: RwLock<ConflictResolutionConfig>,
    max_outstanding: usize,
    shutdown_deadline: Duration,
    shutdown: CancellationToken,
}

impl ClientManager {
    pub fn new(
        config: &BridgeConfig,
        registry: Arc<CapabilityRegistry>,
        audit: Arc<dyn AuditSink>,
        connector: Arc<dyn SessionConnector>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let backends = config
            .backends
            .iter()
            .map(|b| BackendRuntime::new(b.clone()))
            .collect();
        Arc::new(Self {
            backends: RwLock::new(backends),
            registry,
            audit,
            connector,
            conflict: RwLock::new(config.conflict_resolution.clone()),
            max_outstanding: config.limits.max_outstanding,
            shutdown_deadline: Duration::from_secs(config.limits.shutdown_deadline_secs),
            shutdown,
        })
    }

    fn runtime(&self, name: &str) -> Option<Arc<BackendRuntime>> {
        self.backends
            .read()
            .iter()
            .find(|b| b.descriptor.name == name)
            .cloned()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .read()
            .iter()
            .map(|b| b.descriptor.name.clone())
            .collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<BackendConfig>> {
        self.runtime(name).map(|r| r.descriptor.clone())
    }

    /// Live session for routing: present only while the backend is routable.
    pub fn session(&self, name: &str) -> Option<Arc<dyn BackendSession>> {
        let rt = self.runtime(name)?;
        if !rt.phase().routable() {
            return None;
        }
        rt.session.read().clone()
    }

    pub fn phase(&self, name: &str) -> Option<BackendPhase> {
        self.runtime(name).map(|r| r.phase())
    }

    /// Point-in-time status records for the management surface.
    pub fn snapshot(&self) -> Vec<BackendStatusRecord> {
        self.backends
            .read()
            .iter()
            .map(|b| b.status.read().clone())
            .collect()
    }

    /// Launch every backend's initialization concurrently.
    pub async fn start_all(self: &Arc<Self>) {
        let runtimes: Vec<_> = self.backends.read().iter().cloned().collect();
        let tasks: Vec<_> = runtimes
            .into_iter()
            .map(|rt| {
                let mgr = self.clone();
                tokio::spawn(async move {
                    let _guard = rt.slot.lock().await;
                    if let Err(e) = mgr.connect_locked(&rt).await {
                        tracing::warn!(backend = %rt.descriptor.name, error = %e, "backend start failed");
                    }
                })
            })
            .collect();
        for t in tasks {
            let _ = t.await;
        }
        let _ = self.rebuild_routes().await;

        let snapshot = self.snapshot();
        let ready = snapshot.iter().filter(|s| s.phase.routable()).count();
        let failed = snapshot
            .iter()
            .filter(|s| s.phase == BackendPhase::Failed)
            .count();
        tracing::info!(ready, failed, total = snapshot.len(), "backend startup complete");
    }

    /// Connect + handshake + capability fetch for one backend. Caller must
    /// hold the slot lock.
    async fn connect_locked(&self, rt: &BackendRuntime) -> Result<(), BridgeError> {
        let name = &rt.descriptor.name;
        self.transition(rt, BackendPhase::Initializing, reason::STARTED, "");

        let limits = SessionLimits {
            max_outstanding: self.max_outstanding,
            sse_startup: rt.descriptor.timeouts.sse_startup(),
        };
        let connected = self
            .connector
            .connect(&rt.descriptor, &limits, self.shutdown.clone())
            .await;
        let session = match connected {
            Ok(s) => s,
            Err(e) => {
                let err = e.into_bridge(name);
                self.fail_locked(rt, reason::INIT_FAILED, &err.to_string()).await;
                return Err(err);
            }
        };

        let init_deadline = Instant::now() + rt.descriptor.timeouts.init();
        if let Err(e) = session.initialize(init_deadline).await {
            let reason_code = match &e {
                session::SessionError::Timeout { .. } => reason::INIT_TIMEOUT,
                _ => reason::INIT_FAILED,
            };
            let err = e.into_bridge(name);
            session.close().await;
            self.fail_locked(rt, reason_code, &err.to_string()).await;
            return Err(err);
        }

        let mut catalog = Vec::new();
        for kind in CapabilityKind::ALL {
            let deadline = Instant::now() + rt.descriptor.timeouts.cap_fetch();
            match session.list_capabilities(kind, deadline).await {
                Ok(raw) => match filter::normalize_catalog(&rt.descriptor, raw) {
                    Ok(mut records) => catalog.append(&mut records),
                    Err(e) => {
                        let err = BridgeError::Internal(format!("bad filter glob: {e}"));
                        session.close().await;
                        self.fail_locked(rt, reason::CAP_FETCH_FAILED, &err.to_string()).await;
                        return Err(err);
                    }
                },
                Err(session::SessionError::Backend { code, .. })
                    if code == manifold_wire::CODE_METHOD_NOT_FOUND =>
                {
                    // Backends without this capability kind are fine.
                    continue;
                }
                Err(e) => {
                    let err = e.into_bridge(name);
                    session.close().await;
                    self.fail_locked(rt, reason::CAP_FETCH_FAILED, &err.to_string()).await;
                    return Err(err);
                }
            }
        }

        let counts = CapabilityCounts {
            tools: catalog.iter().filter(|c| c.kind == CapabilityKind::Tool).count(),
            resources: catalog
                .iter()
                .filter(|c| c.kind == CapabilityKind::Resource)
                .count(),
            prompts: catalog
                .iter()
                .filter(|c| c.kind == CapabilityKind::Prompt)
                .count(),
        };

        *rt.session.write() = Some(session);
        *rt.catalog.write() = catalog;
        {
            let mut status = rt.status.write();
            status.capabilities = counts;
        }
        self.transition(rt, BackendPhase::Ready, reason::STARTED, "capabilities published");
        rt.epoch.fetch_add(1, Ordering::AcqRel);
        tracing::info!(
            backend = %name,
            tools = counts.tools,
            resources = counts.resources,
            prompts = counts.prompts,
            "backend ready"
        );
        Ok(())
    }

    /// Move a backend to `Failed`, drop its session, and republish routes.
    /// Caller must hold the slot lock.
    async fn fail_locked(&self, rt: &BackendRuntime, reason_code: &str, message: &str) {
        let session = rt.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        rt.catalog.write().clear();
        {
            let mut status = rt.status.write();
            status.capabilities = CapabilityCounts::default();
        }
        self.transition(rt, BackendPhase::Failed, reason_code, message);
    }

    /// Externally-visible failure path (routing terminal, health monitor).
    pub async fn fail_backend(&self, name: &str, reason_code: &str, message: &str) {
        let Some(rt) = self.runtime(name) else { return };
        {
            let _guard = rt.slot.lock().await;
            if rt.phase() == BackendPhase::Failed {
                return;
            }
            self.fail_locked(&rt, reason_code, message).await;
        }
        let _ = self.rebuild_routes().await;
    }

    /// Health-driven `Ready <-> Degraded` movement. No session teardown.
    pub fn set_health(&self, name: &str, healthy: bool, reason_code: &str, message: &str) {
        let Some(rt) = self.runtime(name) else { return };
        let mut status = rt.status.write();
        status.set_condition(CONDITION_HEALTHY, healthy, reason_code, message);
        let next = match (status.phase, healthy) {
            (BackendPhase::Ready, false) => Some(BackendPhase::Degraded),
            (BackendPhase::Degraded, true) => Some(BackendPhase::Ready),
            _ => None,
        };
        if let Some(next) = next {
            let from = status.phase;
            status.phase = next;
            status.set_condition(CONDITION_AVAILABLE, next.routable(), reason_code, message);
            drop(status);
            self.audit_transition(&rt.descriptor.name, from, next, reason_code);
        }
    }

    pub fn record_latency(&self, name: &str, latency: Duration) {
        if let Some(rt) = self.runtime(name) {
            rt.status.write().last_latency_ms =
                Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
        }
    }

    /// Tear a backend down and walk a fresh lifecycle. Concurrent calls
    /// coalesce: whoever loses the slot race observes the bumped epoch and
    /// reports the cycle the winner ran.
    pub async fn reconnect(&self, name: &str) -> Result<ReconnectReport, BridgeError> {
        let rt = self
            .runtime(name)
            .ok_or_else(|| BridgeError::InvalidRequest(format!("unknown backend '{name}'")))?;

        let seen_epoch = rt.epoch.load(Ordering::Acquire);
        {
            let _guard = rt.slot.lock().await;
            if rt.epoch.load(Ordering::Acquire) != seen_epoch {
                return Ok(ReconnectReport {
                    backend: name.to_string(),
                    reconnected: false,
                    phase: rt.phase(),
                });
            }

            self.shutdown_locked(&rt, reason::RECONNECT).await;
            self.transition(&rt, BackendPhase::Pending, reason::RECONNECT, "");
            if let Err(e) = self.connect_locked(&rt).await {
                tracing::warn!(backend = %name, error = %e, "reconnect failed");
                // A failed cycle still completes the coalescing window;
                // queued callers must not each retry it.
                rt.epoch.fetch_add(1, Ordering::AcqRel);
            }
        }
        let _ = self.rebuild_routes().await;

        Ok(ReconnectReport {
            backend: name.to_string(),
            reconnected: true,
            phase: self.phase(name).unwrap_or(BackendPhase::Failed),
        })
    }

    /// Caller must hold the slot lock.
    async fn shutdown_locked(&self, rt: &BackendRuntime, reason_code: &str) {
        self.transition(rt, BackendPhase::ShuttingDown, reason_code, "");
        let session = rt.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        rt.catalog.write().clear();
        {
            let mut status = rt.status.write();
            status.capabilities = CapabilityCounts::default();
        }
    }

    /// Graceful shutdown in reverse start order, bounded by the global
    /// shutdown deadline.
    pub async fn stop_all(&self) {
        let runtimes: Vec<_> = self.backends.read().iter().rev().cloned().collect();
        let work = async {
            for rt in runtimes {
                let _guard = rt.slot.lock().await;
                if rt.phase() != BackendPhase::ShuttingDown {
                    self.shutdown_locked(&rt, reason::SHUTDOWN).await;
                }
            }
        };
        if tokio::time::timeout(self.shutdown_deadline, work).await.is_err() {
            tracing::warn!("backend shutdown exceeded deadline");
        }
        let _ = self.rebuild_routes().await;
    }

    // ── Reload support ────────────────────────────────────────────────

    /// Register a new descriptor and start its lifecycle.
    pub async fn add_backend(&self, descriptor: BackendConfig) -> Result<(), BridgeError> {
        let name = descriptor.name.clone();
        let rt = BackendRuntime::new(descriptor);
        {
            let mut backends = self.backends.write();
            if backends.iter().any(|b| b.descriptor.name == name) {
                return Err(BridgeError::InvalidRequest(format!(
                    "backend '{name}' already exists"
                )));
            }
            backends.push(rt.clone());
        }
        let _guard = rt.slot.lock().await;
        self.connect_locked(&rt).await.map(|()| ())
    }

    /// Shut a backend down and delete its runtime.
    pub async fn remove_backend(&self, name: &str) -> Result<(), BridgeError> {
        let rt = self
            .runtime(name)
            .ok_or_else(|| BridgeError::InvalidRequest(format!("unknown backend '{name}'")))?;
        {
            let _guard = rt.slot.lock().await;
            self.shutdown_locked(&rt, reason::RELOAD).await;
        }
        self.backends.write().retain(|b| b.descriptor.name != name);
        Ok(())
    }

    pub fn set_conflict_config(&self, cfg: ConflictResolutionConfig) {
        *self.conflict.write() = cfg;
    }

    /// Rebuild and publish the route maps from every routable backend's
    /// catalog, in descriptor insertion order. On a fatal build error (the
    /// `error` strategy hit a collision) the previous map stays published.
    pub async fn rebuild_routes(&self) -> Result<(), crate::conflict::ConflictError> {
        let catalogs: Vec<(String, Vec<CapabilityRecord>)> = self
            .backends
            .read()
            .iter()
            .filter(|b| b.phase().routable())
            .map(|b| (b.descriptor.name.clone(), b.catalog.read().clone()))
            .collect();
        let cfg = self.conflict.read().clone();
        match self.registry.rebuild(catalogs, &cfg).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "route map rebuild aborted; previous map stays published");
                Err(e)
            }
        }
    }

    fn transition(&self, rt: &BackendRuntime, next: BackendPhase, reason_code: &str, message: &str) {
        let from = {
            let mut status = rt.status.write();
            let from = status.phase;
            status.phase = next;
            status.set_condition(CONDITION_AVAILABLE, next.routable(), reason_code, message);
            from
        };
        if from != next {
            tracing::info!(
                backend = %rt.descriptor.name,
                from = %from,
                to = %next,
                reason = reason_code,
                "backend phase transition"
            );
            self.audit_transition(&rt.descriptor.name, from, next, reason_code);
        }
    }

    fn audit_transition(
        &self,
        backend: &str,
        from: BackendPhase,
        to: BackendPhase,
        reason_code: &str,
    ) {
        self.audit.record(
            AuditEvent::new(AuditKind::BackendTransition)
                .target(AuditTarget {
                    backend: Some(backend.to_string()),
                    ..AuditTarget::default()
                })
                .meta(serde_json::json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "reason": reason_code,
                })),
        );
    }
}
