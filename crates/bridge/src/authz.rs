//! Role-vs-resource policy evaluation.
//!
//! Policies compile once at startup into glob matchers and evaluate
//! statelessly per request. First match wins; no match falls through to the
//! configured default effect. Resource identifiers follow
//! `kind:capability-name`.

use crate::capability::CapabilityKind;
use crate::config::{AuthorizationConfig, PolicyConfig, PolicyEffect};
use globset::{Glob, GlobMatcher};

#[derive(Debug)]
enum ResourceMatcher {
    Any,
    Kind { kind: CapabilityKind, name: GlobMatcher },
}

#[derive(Debug)]
struct CompiledPolicy {
    effect: PolicyEffect,
    roles: Vec<GlobMatcher>,
    resources: Vec<ResourceMatcher>,
}

impl CompiledPolicy {
    fn matches(&self, roles: &[String], kind: CapabilityKind, name: &str) -> bool {
        let role_hit = roles
            .iter()
            .any(|r| self.roles.iter().any(|m| m.is_match(r)));
        if !role_hit {
            return false;
        }
        self.resources.iter().any(|res| match res {
            ResourceMatcher::Any => true,
            ResourceMatcher::Kind { kind: k, name: m } => *k == kind && m.is_match(name),
        })
    }
}

#[derive(Debug)]
pub struct PolicyEngine {
    policies: Vec<CompiledPolicy>,
    default_effect: PolicyEffect,
}

impl PolicyEngine {
    pub fn compile(config: &AuthorizationConfig) -> Result<Self, String> {
        let mut policies = Vec::with_capacity(config.policies.len());
        for (i, p) in config.policies.iter().enumerate() {
            policies.push(compile_policy(p).map_err(|e| format!("policies[{i}]: {e}"))?);
        }
        Ok(Self {
            policies,
            default_effect: config.default_effect,
        })
    }

    pub fn evaluate(&self, roles: &[String], kind: CapabilityKind, name: &str) -> PolicyEffect {
        for policy in &self.policies {
            if policy.matches(roles, kind, name) {
                return policy.effect;
            }
        }
        self.default_effect
    }
}

fn compile_policy(p: &PolicyConfig) -> Result<CompiledPolicy, String> {
    let mut roles = Vec::with_capacity(p.roles.len());
    for r in &p.roles {
        roles.push(
            Glob::new(r)
                .map_err(|e| format!("bad role glob '{r}': {e}"))?
                .compile_matcher(),
        );
    }

    let mut resources = Vec::with_capacity(p.resources.len());
    for raw in &p.resources {
        if raw == "*" {
            resources.push(ResourceMatcher::Any);
            continue;
        }
        let (kind_str, name_glob) = raw
            .split_once(':')
            .ok_or_else(|| format!("resource '{raw}' must be '*' or 'kind:glob'"))?;
        let kind = CapabilityKind::parse(kind_str)
            .ok_or_else(|| format!("unknown capability kind '{kind_str}' in '{raw}'"))?;
        resources.push(ResourceMatcher::Kind {
            kind,
            name: Glob::new(name_glob)
                .map_err(|e| format!("bad resource glob '{raw}': {e}"))?
                .compile_matcher(),
        });
    }

    Ok(CompiledPolicy {
        effect: p.effect,
        roles,
        resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(default_effect: PolicyEffect, policies: Vec<PolicyConfig>) -> PolicyEngine {
        PolicyEngine::compile(&AuthorizationConfig {
            enabled: true,
            default_effect,
            policies,
        })
        .unwrap()
    }

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn default_deny_rejects_unknown_roles() {
        let e = engine(
            PolicyEffect::Deny,
            vec![PolicyConfig {
                effect: PolicyEffect::Allow,
                roles: vec!["admin".to_string()],
                resources: vec!["*".to_string()],
            }],
        );
        assert_eq!(
            e.evaluate(&roles(&["viewer"]), CapabilityKind::Tool, "anything"),
            PolicyEffect::Deny
        );
        assert_eq!(
            e.evaluate(&roles(&["admin"]), CapabilityKind::Tool, "anything"),
            PolicyEffect::Allow
        );
    }

    #[test]
    fn first_match_wins() {
        let e = engine(
            PolicyEffect::Allow,
            vec![
                PolicyConfig {
                    effect: PolicyEffect::Deny,
                    roles: vec!["*".to_string()],
                    resources: vec!["tool:delete_*".to_string()],
                },
                PolicyConfig {
                    effect: PolicyEffect::Allow,
                    roles: vec!["ops".to_string()],
                    resources: vec!["tool:delete_*".to_string()],
                },
            ],
        );
        // The deny listed first shadows the later allow.
        assert_eq!(
            e.evaluate(&roles(&["ops"]), CapabilityKind::Tool, "delete_repo"),
            PolicyEffect::Deny
        );
    }

    #[test]
    fn resource_patterns_are_kind_scoped() {
        let e = engine(
            PolicyEffect::Deny,
            vec![PolicyConfig {
                effect: PolicyEffect::Allow,
                roles: vec!["reader".to_string()],
                resources: vec!["resource:*".to_string()],
            }],
        );
        assert_eq!(
            e.evaluate(&roles(&["reader"]), CapabilityKind::Resource, "notes"),
            PolicyEffect::Allow
        );
        assert_eq!(
            e.evaluate(&roles(&["reader"]), CapabilityKind::Tool, "notes"),
            PolicyEffect::Deny
        );
    }

    #[test]
    fn role_globs_match() {
        let e = engine(
            PolicyEffect::Deny,
            vec![PolicyConfig {
                effect: PolicyEffect::Allow,
                roles: vec!["team-*".to_string()],
                resources: vec!["tool:search_web".to_string()],
            }],
        );
        assert_eq!(
            e.evaluate(&roles(&["team-search"]), CapabilityKind::Tool, "search_web"),
            PolicyEffect::Allow
        );
        assert_eq!(
            e.evaluate(&roles(&["other"]), CapabilityKind::Tool, "search_web"),
            PolicyEffect::Deny
        );
    }

    #[test]
    fn compile_rejects_unknown_kind() {
        let err = PolicyEngine::compile(&AuthorizationConfig {
            enabled: true,
            default_effect: PolicyEffect::Deny,
            policies: vec![PolicyConfig {
                effect: PolicyEffect::Allow,
                roles: vec!["x".to_string()],
                resources: vec!["widget:*".to_string()],
            }],
        });
        assert!(err.is_err());
    }
}
