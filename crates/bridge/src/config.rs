//! Validated configuration value tree consumed by the core.
//!
//! File parsing, environment expansion, and secret resolution happen before
//! this tree is built; every value here is already resolved. Descriptors are
//! immutable once created and replaced wholesale on reload.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_PREFIX_SEPARATOR: &str = "_";

pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CAP_FETCH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SSE_STARTUP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_OUTSTANDING: usize = 64;

pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEALTH_LATENCY_THRESHOLD_SECS: u64 = 5;
pub const DEFAULT_DEGRADED_THRESHOLD: u32 = 1;
pub const DEFAULT_FAILED_THRESHOLD: u32 = 3;
pub const DEFAULT_SLOW_THRESHOLD: u32 = 3;

pub const DEFAULT_RELOAD_DEADLINE_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 20;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_TOKEN_EXPIRY_BUFFER_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Backend descriptors, keyed by backend name. Insertion order is the
    /// tie-break order for conflict resolution, so the map must preserve it.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub conflict_resolution: ConflictResolutionConfig,

    #[serde(default)]
    pub incoming_auth: IncomingAuthConfig,

    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

impl BridgeConfig {
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

// ============================================================================
// Backend descriptors
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique identifier, charset `[A-Za-z0-9_-]+`.
    pub name: String,

    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<OutgoingAuthConfig>,

    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default)]
    pub filters: FilterRules,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_overrides: BTreeMap<String, ToolOverride>,

    #[serde(default)]
    pub timeouts: BackendTimeouts,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

impl BackendConfig {
    /// Content hash for reload diffing: two descriptors with equal hashes are
    /// treated as unchanged. Map fields are `BTreeMap` so the serialized form
    /// is stable across instances.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        base16(&digest)
    }
}

fn base16(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "transport", content = "connect", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio(StdioConnect),
    Sse(HttpConnect),
    StreamableHttp(HttpConnect),
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Sse(_) => "sse",
            Self::StreamableHttp(_) => "streamable-http",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioConnect {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConnect {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutgoingAuthConfig {
    /// Fixed header set; values already resolved from secrets.
    Static {
        headers: BTreeMap<String, String>,
    },
    /// OAuth2 client-credentials token fetch with cached refresh.
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRules {
    #[serde(default)]
    pub tools: KindFilter,
    #[serde(default)]
    pub resources: KindFilter,
    #[serde(default)]
    pub prompts: KindFilter,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindFilter {
    /// When non-empty, only names matching at least one glob are kept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    /// Names matching any glob are dropped. Deny always wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl KindFilter {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendTimeouts {
    /// Protocol handshake deadline (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<u64>,
    /// Per-kind capability fetch deadline (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_fetch: Option<u64>,
    /// SSE endpoint-discovery / first-read deadline (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_startup: Option<u64>,
    /// Per-call deadline (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<u64>,
}

impl BackendTimeouts {
    pub fn init(&self) -> Duration {
        Duration::from_secs(self.init.unwrap_or(DEFAULT_INIT_TIMEOUT_SECS).max(1))
    }

    pub fn cap_fetch(&self) -> Duration {
        Duration::from_secs(self.cap_fetch.unwrap_or(DEFAULT_CAP_FETCH_TIMEOUT_SECS).max(1))
    }

    pub fn sse_startup(&self) -> Duration {
        Duration::from_secs(
            self.sse_startup
                .unwrap_or(DEFAULT_SSE_STARTUP_TIMEOUT_SECS)
                .max(1),
        )
    }

    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS).max(1))
    }
}

// ============================================================================
// Conflict resolution
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    FirstWins,
    Prefix,
    Priority,
    Error,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionConfig {
    #[serde(default)]
    pub strategy: ConflictStrategy,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Ordered backend names for the `priority` strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
}

fn default_separator() -> String {
    DEFAULT_PREFIX_SEPARATOR.to_string()
}

impl Default for ConflictResolutionConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            separator: default_separator(),
            order: Vec::new(),
        }
    }
}

// ============================================================================
// Incoming auth
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingAuthConfig {
    #[default]
    Anonymous,
    /// Static local token, compared in constant time.
    Local {
        token: String,
        #[serde(default)]
        roles: Vec<String>,
    },
    Jwt(JwtAuthConfig),
    Oidc(JwtAuthConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtAuthConfig {
    pub jwks_uri: String,
    pub issuer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,
    /// Claim carrying the role set (default `roles`).
    #[serde(default = "default_roles_claim")]
    pub roles_claim: String,
}

fn default_algorithms() -> Vec<String> {
    vec!["RS256".to_string()]
}

fn default_roles_claim() -> String {
    "roles".to_string()
}

// ============================================================================
// Authorization
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub default_effect: PolicyEffect,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    Allow,
    #[default]
    Deny,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    pub effect: PolicyEffect,
    /// Role globs this policy applies to.
    pub roles: Vec<String>,
    /// Resource patterns: `kind:name-glob` or the literal `*`.
    pub resources: Vec<String>,
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Rotate when the active file exceeds this many bytes.
    #[serde(default = "default_audit_max_size")]
    pub max_size: u64,
    #[serde(default = "default_audit_backup_count")]
    pub backup_count: u32,
}

fn default_true() -> bool {
    true
}

fn default_audit_max_size() -> u64 {
    16 * 1024 * 1024
}

fn default_audit_backup_count() -> u32 {
    5
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: None,
            max_size: default_audit_max_size(),
            backup_count: default_audit_backup_count(),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_latency_threshold")]
    pub latency_threshold_secs: u64,
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
    #[serde(default = "default_failed_threshold")]
    pub failed_threshold: u32,
}

fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}

fn default_latency_threshold() -> u64 {
    DEFAULT_HEALTH_LATENCY_THRESHOLD_SECS
}

fn default_degraded_threshold() -> u32 {
    DEFAULT_DEGRADED_THRESHOLD
}

fn default_failed_threshold() -> u32 {
    DEFAULT_FAILED_THRESHOLD
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            latency_threshold_secs: DEFAULT_HEALTH_LATENCY_THRESHOLD_SECS,
            degraded_threshold: DEFAULT_DEGRADED_THRESHOLD,
            failed_threshold: DEFAULT_FAILED_THRESHOLD,
        }
    }
}

// ============================================================================
// Process-level limits
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    /// Concurrent outstanding requests per backend session.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_reload_deadline")]
    pub reload_deadline_secs: u64,
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,
}

fn default_max_outstanding() -> usize {
    DEFAULT_MAX_OUTSTANDING
}

fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_reload_deadline() -> u64 {
    DEFAULT_RELOAD_DEADLINE_SECS
}

fn default_shutdown_deadline() -> u64 {
    DEFAULT_SHUTDOWN_DEADLINE_SECS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            reload_deadline_secs: DEFAULT_RELOAD_DEADLINE_SECS,
            shutdown_deadline_secs: DEFAULT_SHUTDOWN_DEADLINE_SECS,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Structural validation for an assembled tree. The file loader calls this
/// once at startup and once per reload candidate.
pub fn validate(config: &BridgeConfig) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for b in &config.backends {
        if b.name.is_empty() || !b.name.chars().all(valid_name_char) {
            return Err(format!(
                "backend name '{}' must match [A-Za-z0-9_-]+",
                b.name
            ));
        }
        if !seen.insert(b.name.as_str()) {
            return Err(format!("duplicate backend name '{}'", b.name));
        }
        if let TransportConfig::Stdio(c) = &b.transport
            && c.command.trim().is_empty()
        {
            return Err(format!("backend '{}': stdio command must be non-empty", b.name));
        }
        if let TransportConfig::Sse(c) | TransportConfig::StreamableHttp(c) = &b.transport
            && c.url.trim().is_empty()
        {
            return Err(format!("backend '{}': url must be non-empty", b.name));
        }
    }

    if config.conflict_resolution.strategy == ConflictStrategy::Priority {
        for name in &config.conflict_resolution.order {
            if !seen.contains(name.as_str()) {
                return Err(format!(
                    "conflictResolution.order references unknown backend '{name}'"
                ));
            }
        }
    }
    if config.conflict_resolution.separator.is_empty() {
        return Err("conflictResolution.separator must be non-empty".to_string());
    }

    for (i, p) in config.authorization.policies.iter().enumerate() {
        if p.roles.is_empty() {
            return Err(format!("authorization.policies[{i}].roles must be non-empty"));
        }
        if p.resources.is_empty() {
            return Err(format!(
                "authorization.policies[{i}].resources must be non-empty"
            ));
        }
        for r in &p.resources {
            if r != "*" && !r.contains(':') {
                return Err(format!(
                    "authorization.policies[{i}]: resource '{r}' must be '*' or 'kind:glob'"
                ));
            }
        }
    }

    if config.audit.enabled && config.audit.backup_count == 0 {
        return Err("audit.backupCount must be at least 1".to_string());
    }

    Ok(())
}

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_backend(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio(StdioConnect {
                command: "server".to_string(),
                args: vec![],
                env: BTreeMap::new(),
            }),
            auth: None,
            group: DEFAULT_GROUP.to_string(),
            filters: FilterRules::default(),
            tool_overrides: BTreeMap::new(),
            timeouts: BackendTimeouts::default(),
        }
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let cfg = BridgeConfig {
            backends: vec![stdio_backend("gh"), stdio_backend("jira")],
            ..BridgeConfig::default()
        };
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let cfg = BridgeConfig {
            backends: vec![stdio_backend("gh"), stdio_backend("gh")],
            ..BridgeConfig::default()
        };
        assert!(validate(&cfg).unwrap_err().contains("duplicate"));
    }

    #[test]
    fn validate_rejects_bad_name_charset() {
        let cfg = BridgeConfig {
            backends: vec![stdio_backend("bad name!")],
            ..BridgeConfig::default()
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn validate_rejects_unknown_priority_order_entry() {
        let cfg = BridgeConfig {
            backends: vec![stdio_backend("gh")],
            conflict_resolution: ConflictResolutionConfig {
                strategy: ConflictStrategy::Priority,
                separator: "_".to_string(),
                order: vec!["nope".to_string()],
            },
            ..BridgeConfig::default()
        };
        assert!(validate(&cfg).unwrap_err().contains("unknown backend"));
    }

    #[test]
    fn validate_rejects_malformed_resource_pattern() {
        let cfg = BridgeConfig {
            backends: vec![],
            authorization: AuthorizationConfig {
                enabled: true,
                default_effect: PolicyEffect::Deny,
                policies: vec![PolicyConfig {
                    effect: PolicyEffect::Allow,
                    roles: vec!["admin".to_string()],
                    resources: vec!["not-a-pattern".to_string()],
                }],
            },
            ..BridgeConfig::default()
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn content_hash_changes_with_descriptor_content() {
        let a = stdio_backend("gh");
        let mut b = stdio_backend("gh");
        assert_eq!(a.content_hash(), b.content_hash());
        b.group = "prod".to_string();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_ignores_map_insertion_order() {
        let mut a = stdio_backend("gh");
        let mut b = stdio_backend("gh");
        if let TransportConfig::Stdio(c) = &mut a.transport {
            c.env.insert("B".to_string(), "2".to_string());
            c.env.insert("A".to_string(), "1".to_string());
        }
        if let TransportConfig::Stdio(c) = &mut b.transport {
            c.env.insert("A".to_string(), "1".to_string());
            c.env.insert("B".to_string(), "2".to_string());
        }
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn outgoing_auth_parses_camel_case_client_credentials() {
        let auth: OutgoingAuthConfig = serde_json::from_value(serde_json::json!({
            "type": "client-credentials",
            "tokenUrl": "https://auth.example.com/token",
            "clientId": "gw",
            "clientSecret": "s",
            "scopes": ["mcp.read"],
        }))
        .unwrap();
        let OutgoingAuthConfig::ClientCredentials { token_url, scopes, .. } = auth else {
            panic!("wrong variant");
        };
        assert_eq!(token_url, "https://auth.example.com/token");
        assert_eq!(scopes, vec!["mcp.read".to_string()]);
    }

    #[test]
    fn unknown_strategy_name_fails_to_parse() {
        // `manual` is deliberately not part of the strategy set.
        let err = serde_json::from_value::<ConflictStrategy>(serde_json::json!("manual"));
        assert!(err.is_err());
    }

    #[test]
    fn timeouts_fall_back_to_defaults() {
        let t = BackendTimeouts::default();
        assert_eq!(t.init(), Duration::from_secs(15));
        assert_eq!(t.cap_fetch(), Duration::from_secs(10));
        assert_eq!(t.call(), Duration::from_secs(60));
    }
}
