//! Authentication layer.
//!
//! Extracts the bearer credential from the context and validates it against
//! the configured provider. The provider set is closed: anonymous, a static
//! local token compared in constant time, or JWT/OIDC validation against
//! JWKS-cached public keys.

use super::{Middleware, Next};
use crate::audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink, AuditSource, AuditTarget};
use crate::config::{IncomingAuthConfig, JwtAuthConfig};
use crate::context::{RequestContext, UserIdentity};
use crate::error::BridgeError;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq as _;

pub enum AuthProvider {
    Anonymous,
    Local {
        token: Vec<u8>,
        roles: Vec<String>,
    },
    Jwt(JwtValidator),
}

impl AuthProvider {
    pub fn from_config(config: &IncomingAuthConfig, http: reqwest::Client) -> Result<Self, String> {
        match config {
            IncomingAuthConfig::Anonymous => Ok(Self::Anonymous),
            IncomingAuthConfig::Local { token, roles } => {
                if token.is_empty() {
                    return Err("incomingAuth.local.token must be non-empty".to_string());
                }
                Ok(Self::Local {
                    token: token.as_bytes().to_vec(),
                    roles: roles.clone(),
                })
            }
            IncomingAuthConfig::Jwt(cfg) => Ok(Self::Jwt(JwtValidator::new(cfg, http, "jwt")?)),
            IncomingAuthConfig::Oidc(cfg) => Ok(Self::Jwt(JwtValidator::new(cfg, http, "oidc")?)),
        }
    }

    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<UserIdentity, String> {
        match self {
            Self::Anonymous => Ok(UserIdentity::anonymous()),
            Self::Local { token, roles } => {
                let Some(presented) = bearer else {
                    return Err("missing bearer token".to_string());
                };
                if presented.as_bytes().ct_eq(token).into() {
                    Ok(UserIdentity {
                        subject: "local".to_string(),
                        email: None,
                        display_name: None,
                        roles: roles.clone(),
                        provider: "local",
                        claims: Value::Null,
                    })
                } else {
                    Err("invalid token".to_string())
                }
            }
            Self::Jwt(validator) => {
                let Some(presented) = bearer else {
                    return Err("missing bearer token".to_string());
                };
                validator.validate(presented).await
            }
        }
    }
}

const JWKS_REFRESH_MIN_INTERVAL: Duration = Duration::from_secs(300);

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

pub struct JwtValidator {
    config: JwtAuthConfig,
    algorithms: Vec<Algorithm>,
    provider: &'static str,
    http: reqwest::Client,
    jwks: RwLock<JwksCache>,
    refresh: tokio::sync::Mutex<()>,
}

impl JwtValidator {
    pub fn new(
        config: &JwtAuthConfig,
        http: reqwest::Client,
        provider: &'static str,
    ) -> Result<Self, String> {
        let mut algorithms = Vec::with_capacity(config.algorithms.len());
        for alg in &config.algorithms {
            algorithms
                .push(Algorithm::from_str(alg).map_err(|_| format!("unknown algorithm '{alg}'"))?);
        }
        if algorithms.is_empty() {
            return Err("incomingAuth: at least one algorithm is required".to_string());
        }
        Ok(Self {
            config: config.clone(),
            algorithms,
            provider,
            http,
            jwks: RwLock::new(JwksCache {
                keys: HashMap::new(),
                fetched_at: None,
            }),
            refresh: tokio::sync::Mutex::new(()),
        })
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, String> {
        if let Some(key) = self.jwks.read().keys.get(kid) {
            return Ok(key.clone());
        }

        let _guard = self.refresh.lock().await;
        if let Some(key) = self.jwks.read().keys.get(kid) {
            return Ok(key.clone());
        }
        // Unknown kid: refresh, rate-limited so a flood of bad tokens cannot
        // hammer the JWKS endpoint.
        let recently = self
            .jwks
            .read()
            .fetched_at
            .is_some_and(|t| t.elapsed() < JWKS_REFRESH_MIN_INTERVAL);
        if !recently {
            self.fetch_jwks().await?;
        }
        self.jwks
            .read()
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| format!("no JWKS key for kid '{kid}'"))
    }

    async fn fetch_jwks(&self) -> Result<(), String> {
        let body: Value = self
            .http
            .get(&self.config.jwks_uri)
            .send()
            .await
            .map_err(|e| format!("jwks fetch: {e}"))?
            .json()
            .await
            .map_err(|e| format!("jwks body: {e}"))?;

        let mut keys = HashMap::new();
        for jwk in body
            .get("keys")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let (Some(kid), Some(kty)) = (
                jwk.get("kid").and_then(Value::as_str),
                jwk.get("kty").and_then(Value::as_str),
            ) else {
                continue;
            };
            if kty != "RSA" {
                continue;
            }
            let (Some(n), Some(e)) = (
                jwk.get("n").and_then(Value::as_str),
                jwk.get("e").and_then(Value::as_str),
            ) else {
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => {
                    keys.insert(kid.to_string(), key);
                }
                Err(err) => {
                    tracing::warn!(kid, error = %err, "skipping unparsable JWKS key");
                }
            }
        }

        let mut cache = self.jwks.write();
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }

    pub async fn validate(&self, token: &str) -> Result<UserIdentity, String> {
        let header = decode_header(token).map_err(|e| format!("bad token header: {e}"))?;
        let kid = header.kid.ok_or_else(|| "token missing kid".to_string())?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(self.algorithms[0]);
        validation.algorithms.clone_from(&self.algorithms);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        if self.config.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audiences);
        }
        validation.validate_nbf = true;

        let data =
            decode::<Value>(token, &key, &validation).map_err(|e| format!("invalid token: {e}"))?;
        let claims = data.claims;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if subject.is_empty() {
            return Err("token missing sub".to_string());
        }

        let roles = claims
            .get(&self.config.roles_claim)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(UserIdentity {
            subject,
            email: claims
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string),
            display_name: claims
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            roles,
            provider: self.provider,
            claims,
        })
    }
}

pub struct AuthMiddleware {
    provider: Arc<AuthProvider>,
    audit: Arc<dyn AuditSink>,
}

impl AuthMiddleware {
    pub fn new(provider: Arc<AuthProvider>, audit: Arc<dyn AuditSink>) -> Self {
        Self { provider, audit }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        match self.provider.authenticate(ctx.bearer.as_deref()).await {
            Ok(identity) => {
                ctx.identity = identity;
                next.run(ctx).await
            }
            Err(reason) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    capability = %ctx.capability,
                    reason,
                    "authentication failed"
                );
                self.audit.record(
                    AuditEvent::new(AuditKind::AuthFailure)
                        .source(AuditSource {
                            session_id: ctx.session_id.clone(),
                            client_addr: ctx.client_addr.clone(),
                            subject: None,
                        })
                        .target(AuditTarget {
                            method: Some(ctx.method.as_str().to_string()),
                            exposed_name: Some(ctx.capability.clone()),
                            ..AuditTarget::default()
                        })
                        .outcome(AuditOutcome {
                            status: "unauthenticated".to_string(),
                            latency_ms: Some(ctx.elapsed_ms()),
                            error_kind: Some("unauthenticated".to_string()),
                            error_type: None,
                        }),
                );
                Err(BridgeError::Unauthenticated(reason))
            }
        }
    }
}
