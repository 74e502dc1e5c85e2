//! Capability registry: the authoritative aggregated catalog and route maps.
//!
//! The published value is immutable; a rebuild constructs a fresh
//! [`RouteMaps`] and installs it with an atomic pointer swap. Readers load a
//! snapshot and never block or observe a half-built map. Rebuild requests
//! arriving while a rebuild is running coalesce into one follow-up pass.

use crate::audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink, AuditTarget};
use crate::capability::{CapabilityKind, CapabilityRecord, RouteTarget};
use crate::conflict::{self, ConflictError};
use crate::config::ConflictResolutionConfig;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One published generation of the aggregated surface.
#[derive(Debug, Default)]
pub struct RouteMaps {
    pub version: u64,
    tools: HashMap<String, RouteTarget>,
    resources: HashMap<String, RouteTarget>,
    prompts: HashMap<String, RouteTarget>,
    records: Vec<CapabilityRecord>,
}

impl RouteMaps {
    pub fn resolve(&self, kind: CapabilityKind, exposed_name: &str) -> Option<&RouteTarget> {
        self.map_for(kind).get(exposed_name)
    }

    pub fn map_for(&self, kind: CapabilityKind) -> &HashMap<String, RouteTarget> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    pub fn records(&self) -> &[CapabilityRecord] {
        &self.records
    }

    pub fn list(&self, kind: CapabilityKind) -> impl Iterator<Item = &CapabilityRecord> {
        self.records.iter().filter(move |r| r.kind == kind)
    }

    pub fn count(&self, kind: CapabilityKind) -> usize {
        self.map_for(kind).len()
    }
}

/// Filter options for catalog list queries on the management surface.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub kind: Option<CapabilityKind>,
    pub backend: Option<String>,
    pub group: Option<String>,
}

pub struct CapabilityRegistry {
    current: ArcSwap<RouteMaps>,
    version: AtomicU64,
    rebuild_gate: tokio::sync::Mutex<()>,
    rebuild_pending: AtomicBool,
    audit: Arc<dyn AuditSink>,
}

impl CapabilityRegistry {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteMaps::default()),
            version: AtomicU64::new(0),
            rebuild_gate: tokio::sync::Mutex::new(()),
            rebuild_pending: AtomicBool::new(false),
            audit,
        }
    }

    /// Lock-free snapshot of the current published maps.
    pub fn snapshot(&self) -> Arc<RouteMaps> {
        self.current.load_full()
    }

    /// Single-lookup read on the hot path.
    pub fn resolve(&self, kind: CapabilityKind, exposed_name: &str) -> Option<RouteTarget> {
        self.current.load().resolve(kind, exposed_name).cloned()
    }

    pub fn list(&self, filter: &ListFilter) -> Vec<CapabilityRecord> {
        let snapshot = self.current.load();
        snapshot
            .records()
            .iter()
            .filter(|r| filter.kind.is_none_or(|k| r.kind == k))
            .filter(|r| filter.backend.as_deref().is_none_or(|b| r.backend == b))
            .filter(|r| filter.group.as_deref().is_none_or(|g| r.group == g))
            .cloned()
            .collect()
    }

    /// Run filter+conflict resolution over the supplied per-backend catalogs
    /// and publish the result.
    ///
    /// Catalogs must already be normalized (filtered and renamed) and in
    /// descriptor insertion order. For the `error` strategy a collision
    /// aborts the build and the previous generation stays published.
    pub async fn rebuild(
        &self,
        catalogs: Vec<(String, Vec<CapabilityRecord>)>,
        cfg: &ConflictResolutionConfig,
    ) -> Result<u64, ConflictError> {
        // Coalesce: a rebuild already holding the gate serves concurrent
        // requests; the pending flag schedules exactly one follow-up.
        let _gate = match self.rebuild_gate.try_lock() {
            Ok(g) => g,
            Err(_) => {
                self.rebuild_pending.store(true, Ordering::Release);
                let g = self.rebuild_gate.lock().await;
                if !self.rebuild_pending.swap(false, Ordering::AcqRel) {
                    // Another waiter already ran the follow-up with fresher
                    // inputs than ours.
                    return Ok(self.version.load(Ordering::Acquire));
                }
                g
            }
        };

        let merged = conflict::merge_catalogs(&catalogs, cfg)?;

        for dropped in &merged.dropped {
            self.audit.record(
                AuditEvent::new(AuditKind::CapabilityDropped)
                    .target(AuditTarget {
                        backend: Some(dropped.losing_backend.clone()),
                        exposed_name: Some(dropped.exposed_name.clone()),
                        ..AuditTarget::default()
                    })
                    .outcome(AuditOutcome {
                        status: "dropped".to_string(),
                        ..AuditOutcome::default()
                    })
                    .meta(serde_json::json!({
                        "kind": dropped.kind.as_str(),
                        "winningBackend": dropped.winning_backend,
                    })),
            );
        }

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let maps = RouteMaps {
            version,
            tools: merged.tools,
            resources: merged.resources,
            prompts: merged.prompts,
            records: merged.records,
        };
        self.current.store(Arc::new(maps));
        tracing::debug!(version, "route maps published");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::capability::CapabilityDetail;
    use crate::config::ConflictStrategy;

    fn tool_record(backend: &str, name: &str) -> CapabilityRecord {
        CapabilityRecord {
            exposed_name: name.to_string(),
            original_name: name.to_string(),
            kind: CapabilityKind::Tool,
            backend: backend.to_string(),
            group: "default".to_string(),
            description: None,
            detail: CapabilityDetail::Tool {
                input_schema: serde_json::json!({}),
            },
        }
    }

    fn registry() -> (CapabilityRegistry, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        (CapabilityRegistry::new(audit.clone()), audit)
    }

    fn cfg() -> ConflictResolutionConfig {
        ConflictResolutionConfig {
            strategy: ConflictStrategy::FirstWins,
            separator: "_".to_string(),
            order: vec![],
        }
    }

    #[tokio::test]
    async fn rebuild_publishes_new_version() {
        let (reg, _) = registry();
        assert_eq!(reg.snapshot().version, 0);
        reg.rebuild(
            vec![("gh".to_string(), vec![tool_record("gh", "search")])],
            &cfg(),
        )
        .await
        .unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.resolve(CapabilityKind::Tool, "search").unwrap().backend, "gh");
    }

    #[tokio::test]
    async fn failed_error_strategy_build_keeps_previous_generation() {
        let (reg, _) = registry();
        reg.rebuild(
            vec![("gh".to_string(), vec![tool_record("gh", "search")])],
            &cfg(),
        )
        .await
        .unwrap();

        let mut error_cfg = cfg();
        error_cfg.strategy = ConflictStrategy::Error;
        let result = reg
            .rebuild(
                vec![
                    ("gh".to_string(), vec![tool_record("gh", "search")]),
                    ("jira".to_string(), vec![tool_record("jira", "search")]),
                ],
                &error_cfg,
            )
            .await;
        assert!(result.is_err());

        let snap = reg.snapshot();
        assert_eq!(snap.version, 1);
        assert!(snap.resolve(CapabilityKind::Tool, "search").is_some());
    }

    #[tokio::test]
    async fn dropped_capabilities_are_audited() {
        let (reg, audit) = registry();
        reg.rebuild(
            vec![
                ("gh".to_string(), vec![tool_record("gh", "search")]),
                ("jira".to_string(), vec![tool_record("jira", "search")]),
            ],
            &cfg(),
        )
        .await
        .unwrap();

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, AuditKind::CapabilityDropped));
        assert_eq!(events[0].target.backend.as_deref(), Some("jira"));
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_backend() {
        let (reg, _) = registry();
        reg.rebuild(
            vec![
                ("gh".to_string(), vec![tool_record("gh", "a")]),
                ("jira".to_string(), vec![tool_record("jira", "b")]),
            ],
            &cfg(),
        )
        .await
        .unwrap();

        let all = reg.list(&ListFilter::default());
        assert_eq!(all.len(), 2);

        let gh_only = reg.list(&ListFilter {
            backend: Some("gh".to_string()),
            ..ListFilter::default()
        });
        assert_eq!(gh_only.len(), 1);
        assert_eq!(gh_only[0].exposed_name, "a");

        let prompts = reg.list(&ListFilter {
            kind: Some(CapabilityKind::Prompt),
            ..ListFilter::default()
        });
        assert!(prompts.is_empty());
    }

    #[tokio::test]
    async fn readers_see_whole_generations_under_concurrent_rebuilds() {
        let (reg, _) = registry();
        let reg = Arc::new(reg);

        // Each generation publishes a pair that must be observed together.
        let writer = {
            let reg = reg.clone();
            tokio::spawn(async move {
                for i in 0..50u32 {
                    let pair = vec![(
                        "gh".to_string(),
                        vec![
                            tool_record("gh", &format!("left_{i}")),
                            tool_record("gh", &format!("right_{i}")),
                        ],
                    )];
                    reg.rebuild(pair, &cfg()).await.unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let snap = reg.snapshot();
                        if snap.version == 0 {
                            continue;
                        }
                        let lefts: Vec<_> = snap
                            .map_for(CapabilityKind::Tool)
                            .keys()
                            .filter(|k| k.starts_with("left_"))
                            .collect();
                        assert_eq!(lefts.len(), 1, "mixed generation observed");
                        let i = lefts[0].strip_prefix("left_").unwrap();
                        assert!(
                            snap.resolve(CapabilityKind::Tool, &format!("right_{i}")).is_some(),
                            "half-built map observed"
                        );
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
