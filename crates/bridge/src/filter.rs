//! Capability filtering and renaming.
//!
//! Pure functions from a raw per-backend catalog plus the descriptor's rule
//! set to a normalized catalog. Filtering runs first (allow, then deny; deny
//! always wins), renaming second. The original name is preserved on the
//! record so the routing terminal can restore it on dispatch.

use crate::capability::{CapabilityKind, CapabilityRecord, RawCapability};
use crate::config::{BackendConfig, KindFilter};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Compiled allow/deny rule set for one capability kind.
#[derive(Debug, Default)]
pub struct CompiledFilter {
    allow: Option<GlobSet>,
    deny: Option<GlobSet>,
}

impl CompiledFilter {
    pub fn compile(rules: &KindFilter) -> Result<Self, globset::Error> {
        Ok(Self {
            allow: compile_globs(&rules.allow)?,
            deny: compile_globs(&rules.deny)?,
        })
    }

    pub fn keeps(&self, name: &str) -> bool {
        if let Some(allow) = &self.allow
            && !allow.is_match(name)
        {
            return false;
        }
        if let Some(deny) = &self.deny
            && deny.is_match(name)
        {
            return false;
        }
        true
    }
}

fn compile_globs(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    Ok(Some(builder.build()?))
}

/// Apply the descriptor's filter and override rules to a raw catalog.
///
/// Deterministic: output order follows input order, and rule order within
/// `allow`/`deny` does not affect the outcome.
pub fn normalize_catalog(
    backend: &BackendConfig,
    raw: Vec<RawCapability>,
) -> Result<Vec<CapabilityRecord>, globset::Error> {
    let tools = CompiledFilter::compile(&backend.filters.tools)?;
    let resources = CompiledFilter::compile(&backend.filters.resources)?;
    let prompts = CompiledFilter::compile(&backend.filters.prompts)?;

    let mut out = Vec::with_capacity(raw.len());
    for cap in raw {
        let filter = match cap.kind {
            CapabilityKind::Tool => &tools,
            CapabilityKind::Resource => &resources,
            CapabilityKind::Prompt => &prompts,
        };
        if !filter.keeps(&cap.name) {
            continue;
        }

        let mut exposed_name = cap.name.clone();
        let mut description = cap.description;
        if cap.kind == CapabilityKind::Tool
            && let Some(ov) = backend.tool_overrides.get(&cap.name)
        {
            if let Some(name) = &ov.name {
                exposed_name = name.clone();
            }
            if let Some(desc) = &ov.description {
                description = Some(desc.clone());
            }
        }

        out.push(CapabilityRecord {
            exposed_name,
            original_name: cap.name,
            kind: cap.kind,
            backend: backend.name.clone(),
            group: backend.group.clone(),
            description,
            detail: cap.detail,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityDetail;
    use crate::config::{FilterRules, StdioConnect, ToolOverride, TransportConfig};
    use std::collections::BTreeMap;

    fn backend_with(filters: FilterRules, overrides: BTreeMap<String, ToolOverride>) -> BackendConfig {
        BackendConfig {
            name: "gh".to_string(),
            transport: TransportConfig::Stdio(StdioConnect {
                command: "server".to_string(),
                args: vec![],
                env: BTreeMap::new(),
            }),
            auth: None,
            group: "default".to_string(),
            filters,
            tool_overrides: overrides,
            timeouts: Default::default(),
        }
    }

    fn tool(name: &str) -> RawCapability {
        RawCapability {
            name: name.to_string(),
            description: None,
            kind: CapabilityKind::Tool,
            detail: CapabilityDetail::Tool {
                input_schema: serde_json::json!({"type": "object"}),
            },
        }
    }

    #[test]
    fn deny_overrides_allow() {
        let filters = FilterRules {
            tools: KindFilter {
                allow: vec!["search_*".to_string()],
                deny: vec!["search_internal".to_string()],
            },
            ..FilterRules::default()
        };
        let raw = vec![tool("search_web"), tool("search_internal"), tool("foo")];
        let out = normalize_catalog(&backend_with(filters, BTreeMap::new()), raw).unwrap();
        let names: Vec<&str> = out.iter().map(|c| c.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["search_web"]);
    }

    #[test]
    fn empty_allow_keeps_everything_not_denied() {
        let filters = FilterRules {
            tools: KindFilter {
                allow: vec![],
                deny: vec!["secret_*".to_string()],
            },
            ..FilterRules::default()
        };
        let raw = vec![tool("a"), tool("secret_b"), tool("c")];
        let out = normalize_catalog(&backend_with(filters, BTreeMap::new()), raw).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn rename_preserves_original_name() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "search".to_string(),
            ToolOverride {
                name: Some("web_search".to_string()),
                description: Some("Search the web".to_string()),
            },
        );
        let out =
            normalize_catalog(&backend_with(FilterRules::default(), overrides), vec![tool("search")])
                .unwrap();
        assert_eq!(out[0].exposed_name, "web_search");
        assert_eq!(out[0].original_name, "search");
        assert_eq!(out[0].description.as_deref(), Some("Search the web"));
    }

    #[test]
    fn override_for_filtered_out_tool_is_ignored() {
        let filters = FilterRules {
            tools: KindFilter {
                allow: vec![],
                deny: vec!["search".to_string()],
            },
            ..FilterRules::default()
        };
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "search".to_string(),
            ToolOverride {
                name: Some("web_search".to_string()),
                description: None,
            },
        );
        let out = normalize_catalog(&backend_with(filters, overrides), vec![tool("search")]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn filters_are_per_kind() {
        let filters = FilterRules {
            tools: KindFilter {
                allow: vec![],
                deny: vec!["readme".to_string()],
            },
            ..FilterRules::default()
        };
        let resource = RawCapability {
            name: "readme".to_string(),
            description: None,
            kind: CapabilityKind::Resource,
            detail: CapabilityDetail::Resource {
                uri: "file:///readme".to_string(),
                mime_type: None,
            },
        };
        let out = normalize_catalog(
            &backend_with(filters, BTreeMap::new()),
            vec![tool("readme"), resource],
        )
        .unwrap();
        // The tool is denied, the same-named resource is untouched.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, CapabilityKind::Resource);
    }
}
