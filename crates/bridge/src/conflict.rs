//! Conflict resolution: merge filtered per-backend catalogs into route maps.
//!
//! Collisions between backends are resolved by the configured strategy.
//! Ties always break by descriptor insertion order, which is the order of
//! `catalogs` as passed in.

use crate::capability::{CapabilityKind, CapabilityRecord, RouteTarget};
use crate::config::{ConflictResolutionConfig, ConflictStrategy};
use std::collections::HashMap;

/// A capability that lost a collision and was left out of the route map.
#[derive(Debug, Clone)]
pub struct DroppedCapability {
    pub exposed_name: String,
    pub kind: CapabilityKind,
    pub losing_backend: String,
    pub winning_backend: String,
}

#[derive(Debug, Default)]
pub struct MergedCatalog {
    pub tools: HashMap<String, RouteTarget>,
    pub resources: HashMap<String, RouteTarget>,
    pub prompts: HashMap<String, RouteTarget>,
    /// Flat catalog in publication order, post-conflict names.
    pub records: Vec<CapabilityRecord>,
    pub dropped: Vec<DroppedCapability>,
}

impl MergedCatalog {
    pub fn map_for(&self, kind: CapabilityKind) -> &HashMap<String, RouteTarget> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    fn map_for_mut(&mut self, kind: CapabilityKind) -> &mut HashMap<String, RouteTarget> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::Prompt => &mut self.prompts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(
    "capability name conflict: '{exposed_name}' ({kind}) is provided by both \
     '{first_backend}' and '{second_backend}'"
)]
pub struct ConflictError {
    pub exposed_name: String,
    pub kind: CapabilityKind,
    pub first_backend: String,
    pub second_backend: String,
}

/// Merge catalogs under the configured strategy.
///
/// `catalogs` must be in descriptor insertion order; for `priority`, backends
/// named in `order` are considered before the rest (which keep insertion
/// order among themselves).
pub fn merge_catalogs(
    catalogs: &[(String, Vec<CapabilityRecord>)],
    cfg: &ConflictResolutionConfig,
) -> Result<MergedCatalog, ConflictError> {
    let ordered = match cfg.strategy {
        ConflictStrategy::Priority => priority_order(catalogs, &cfg.order),
        _ => (0..catalogs.len()).collect(),
    };

    let mut merged = MergedCatalog::default();

    for idx in ordered {
        let (backend, records) = &catalogs[idx];
        for record in records {
            let exposed = match cfg.strategy {
                ConflictStrategy::Prefix => {
                    format!("{backend}{}{}", cfg.separator, record.exposed_name)
                }
                _ => record.exposed_name.clone(),
            };

            let holder = merged
                .map_for(record.kind)
                .get(&exposed)
                .map(|t| t.backend.clone());
            if let Some(winning_backend) = holder {
                match cfg.strategy {
                    ConflictStrategy::Error => {
                        return Err(ConflictError {
                            exposed_name: exposed,
                            kind: record.kind,
                            first_backend: winning_backend,
                            second_backend: backend.clone(),
                        });
                    }
                    // First entry in scan order wins for every non-error
                    // strategy; prefix cannot collide across backends but a
                    // backend may expose a duplicate name itself.
                    _ => {
                        merged.dropped.push(DroppedCapability {
                            exposed_name: exposed,
                            kind: record.kind,
                            losing_backend: backend.clone(),
                            winning_backend,
                        });
                        continue;
                    }
                }
            }

            // Resources are addressed by URI on the backend wire, so the
            // dispatch identifier for a resource route is its URI.
            let dispatch_name = match &record.detail {
                crate::capability::CapabilityDetail::Resource { uri, .. } => uri.clone(),
                _ => record.original_name.clone(),
            };
            merged.map_for_mut(record.kind).insert(
                exposed.clone(),
                RouteTarget {
                    backend: backend.clone(),
                    original_name: dispatch_name,
                },
            );
            let mut published = record.clone();
            published.exposed_name = exposed;
            merged.records.push(published);
        }
    }

    Ok(merged)
}

/// Scan order for the priority strategy: listed backends first, in list
/// order, then unlisted ones in insertion order.
fn priority_order(catalogs: &[(String, Vec<CapabilityRecord>)], order: &[String]) -> Vec<usize> {
    let mut out = Vec::with_capacity(catalogs.len());
    for name in order {
        if let Some(i) = catalogs.iter().position(|(b, _)| b == name) {
            out.push(i);
        }
    }
    for (i, (name, _)) in catalogs.iter().enumerate() {
        if !order.contains(name) {
            out.push(i);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityDetail;

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

    fn catalogs() -> Vec<(String, Vec<CapabilityRecord>)> {
        vec![
            (
                "gh".to_string(),
                vec![tool_record("gh", "search"), tool_record("gh", "issues")],
            ),
            (
                "jira".to_string(),
                vec![tool_record("jira", "search"), tool_record("jira", "boards")],
            ),
        ]
    }

    fn cfg(strategy: ConflictStrategy) -> ConflictResolutionConfig {
        ConflictResolutionConfig {
            strategy,
            separator: "_".to_string(),
            order: vec![],
        }
    }

    #[test]
    fn first_wins_keeps_first_and_reports_drop() {
        let merged = merge_catalogs(&catalogs(), &cfg(ConflictStrategy::FirstWins)).unwrap();
        assert_eq!(merged.tools["search"].backend, "gh");
        assert_eq!(merged.dropped.len(), 1);
        assert_eq!(merged.dropped[0].losing_backend, "jira");
        assert_eq!(merged.dropped[0].winning_backend, "gh");
        assert_eq!(merged.tools.len(), 3);
    }

    #[test]
    fn prefix_renames_every_entry() {
        let merged = merge_catalogs(&catalogs(), &cfg(ConflictStrategy::Prefix)).unwrap();
        assert!(merged.tools.contains_key("gh_search"));
        assert!(merged.tools.contains_key("jira_search"));
        assert!(!merged.tools.contains_key("search"));
        assert_eq!(merged.tools["gh_search"].original_name, "search");
        assert!(merged.dropped.is_empty());
    }

    #[test]
    fn priority_prefers_listed_backends() {
        let mut c = cfg(ConflictStrategy::Priority);
        c.order = vec!["jira".to_string()];
        let merged = merge_catalogs(&catalogs(), &c).unwrap();
        assert_eq!(merged.tools["search"].backend, "jira");
        // gh (unlisted) still contributes its non-colliding tools.
        assert!(merged.tools.contains_key("issues"));
    }

    #[test]
    fn priority_tie_breaks_by_insertion_order_for_unlisted() {
        let merged = merge_catalogs(&catalogs(), &cfg(ConflictStrategy::Priority)).unwrap();
        assert_eq!(merged.tools["search"].backend, "gh");
    }

    #[test]
    fn error_strategy_aborts_on_collision() {
        let err = merge_catalogs(&catalogs(), &cfg(ConflictStrategy::Error)).unwrap_err();
        assert_eq!(err.exposed_name, "search");
        assert_eq!(err.first_backend, "gh");
        assert_eq!(err.second_backend, "jira");
    }

    #[test]
    fn collisions_are_scoped_per_kind() {
        let mut cats = catalogs();
        cats[1].1.push(CapabilityRecord {
            kind: CapabilityKind::Prompt,
            detail: CapabilityDetail::Prompt { arguments: vec![] },
            ..tool_record("jira", "issues")
        });
        let merged = merge_catalogs(&cats, &cfg(ConflictStrategy::Error));
        // `issues` exists as both a gh tool and a jira prompt: no conflict.
        assert!(merged.is_ok());
    }

    #[test]
    fn records_keep_post_conflict_names() {
        let merged = merge_catalogs(&catalogs(), &cfg(ConflictStrategy::Prefix)).unwrap();
        let names: Vec<&str> = merged.records.iter().map(|r| r.exposed_name.as_str()).collect();
        assert!(names.contains(&"gh_search"));
        assert!(names.contains(&"jira_boards"));
    }
}
