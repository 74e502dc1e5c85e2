//! Hot-reload orchestration.
//!
//! One reload runs at a time; everything else keeps servicing traffic. The
//! coordinator diffs descriptors by name and content hash, serializes the
//! add/remove/restart work against live traffic through the client
//! manager's per-backend slots, and triggers exactly one route-map rebuild
//! at commit.

use crate::audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink};
use crate::config::{BackendConfig, BridgeConfig};
use crate::error::BridgeError;
use crate::manager::ClientManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug)]
pub struct ConfigDiff {
    pub added: Vec<BackendConfig>,
    pub removed: Vec<String>,
    pub changed: Vec<BackendConfig>,
}

/// Compare old and new descriptor sets by name and content hash.
pub fn diff_backends(old: &[BackendConfig], new: &[BackendConfig]) -> ConfigDiff {
    let old_hashes: HashMap<&str, String> = old
        .iter()
        .map(|b| (b.name.as_str(), b.content_hash()))
        .collect();
    let new_names: HashMap<&str, ()> = new.iter().map(|b| (b.name.as_str(), ())).collect();

    let mut added = Vec::new();
    let mut changed = Vec::new();
    for b in new {
        match old_hashes.get(b.name.as_str()) {
            None => added.push(b.clone()),
            Some(old_hash) if *old_hash != b.content_hash() => changed.push(b.clone()),
            Some(_) => {}
        }
    }

    let removed = old
        .iter()
        .filter(|b| !new_names.contains_key(b.name.as_str()))
        .map(|b| b.name.clone())
        .collect();

    ConfigDiff {
        added,
        removed,
        changed,
    }
}

pub struct ReloadCoordinator {
    manager: Arc<ClientManager>,
    audit: Arc<dyn AuditSink>,
    lock: tokio::sync::Mutex<()>,
    deadline: Duration,
    current: parking_lot::Mutex<Arc<BridgeConfig>>,
}

impl ReloadCoordinator {
    pub fn new(
        manager: Arc<ClientManager>,
        audit: Arc<dyn AuditSink>,
        initial: Arc<BridgeConfig>,
    ) -> Self {
        let deadline = Duration::from_secs(initial.limits.reload_deadline_secs.max(1));
        Self {
            manager,
            audit,
            lock: tokio::sync::Mutex::new(()),
            deadline,
            current: parking_lot::Mutex::new(initial),
        }
    }

    pub fn current_config(&self) -> Arc<BridgeConfig> {
        self.current.lock().clone()
    }

    /// Apply a new validated configuration tree.
    pub async fn reload(&self, new_config: BridgeConfig) -> Result<ReloadReport, BridgeError> {
        // One reload in flight at a time; everything else proceeds.
        let _guard = self.lock.lock().await;

        let old_config = self.current_config();
        let diff = diff_backends(&old_config.backends, &new_config.backends);
        let mut report = ReloadReport {
            added: diff.added.iter().map(|b| b.name.clone()).collect(),
            removed: diff.removed.clone(),
            changed: diff.changed.iter().map(|b| b.name.clone()).collect(),
            errors: Vec::new(),
        };

        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            "reload starting"
        );

        self.manager
            .set_conflict_config(new_config.conflict_resolution.clone());

        let apply = self.apply_diff(diff, &mut report);
        if tokio::time::timeout(self.deadline, apply).await.is_err() {
            report
                .errors
                .push(format!("reload deadline of {:?} exceeded", self.deadline));
        }

        // One rebuild at commit; per-backend transitions above already
        // republished intermediate states.
        if let Err(e) = self.manager.rebuild_routes().await {
            report.errors.push(format!("route map rebuild: {e}"));
        }
        *self.current.lock() = Arc::new(new_config);

        self.audit.record(
            AuditEvent::new(AuditKind::Reload)
                .outcome(AuditOutcome {
                    status: if report.errors.is_empty() {
                        "ok".to_string()
                    } else {
                        "partial".to_string()
                    },
                    ..AuditOutcome::default()
                })
                .meta(serde_json::json!({
                    "added": report.added,
                    "removed": report.removed,
                    "changed": report.changed,
                    "errors": report.errors,
                })),
        );

        tracing::info!(errors = report.errors.len(), "reload complete");
        Ok(report)
    }

    async fn apply_diff(&self, diff: ConfigDiff, report: &mut ReloadReport) {
        for name in &diff.removed {
            if let Err(e) = self.manager.remove_backend(name).await {
                report.errors.push(format!("remove '{name}': {e}"));
            }
        }

        for descriptor in diff.added {
            let name = descriptor.name.clone();
            if let Err(e) = self.manager.add_backend(descriptor).await {
                report.errors.push(format!("add '{name}': {e}"));
            }
        }

        for descriptor in diff.changed {
            let name = descriptor.name.clone();
            if let Err(e) = self.manager.remove_backend(&name).await {
                report.errors.push(format!("restart '{name}': {e}"));
                continue;
            }
            if let Err(e) = self.manager.add_backend(descriptor).await {
                report.errors.push(format!("restart '{name}': {e}"));
            }
        }
    }
}
