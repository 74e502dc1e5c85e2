//! Outgoing auth for HTTP-based backend transports.
//!
//! Two strategies: a fixed header set (values already resolved from
//! secrets), and OAuth2 client-credentials with a cached bearer token. The
//! token cache refreshes before a buffer ahead of the declared expiry; a
//! single-flight guard prevents duplicate refreshes; on fetch failure the
//! session logs and proceeds with no bearer header.

use crate::config::{DEFAULT_TOKEN_EXPIRY_BUFFER_SECS, OutgoingAuthConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub enum OutgoingAuth {
    None,
    Static(HeaderMap),
    ClientCredentials(Arc<TokenClient>),
}

impl OutgoingAuth {
    pub fn from_config(config: Option<&OutgoingAuthConfig>, http: reqwest::Client) -> Self {
        match config {
            None => Self::None,
            Some(OutgoingAuthConfig::Static { headers }) => {
                Self::Static(build_static_headers(headers))
            }
            Some(OutgoingAuthConfig::ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scopes,
            }) => Self::ClientCredentials(Arc::new(TokenClient::new(Box::new(HttpTokenFetcher {
                http,
                token_url: token_url.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                scopes: scopes.clone(),
            })))),
        }
    }

    /// Merge auth headers into an outgoing request.
    pub async fn apply(&self, headers: &mut HeaderMap) {
        match self {
            Self::None => {}
            Self::Static(fixed) => {
                for (k, v) in fixed {
                    headers.insert(k.clone(), v.clone());
                }
            }
            Self::ClientCredentials(client) => {
                if let Some(token) = client.bearer().await
                    && let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}"))
                {
                    headers.insert(AUTHORIZATION, v);
                }
            }
        }
    }
}

fn build_static_headers(raw: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (k, v) in raw {
        if let Ok(name) = HeaderName::from_bytes(k.as_bytes())
            && let Ok(value) = HeaderValue::from_str(v)
        {
            headers.insert(name, value);
        } else {
            tracing::warn!(header = %k, "skipping invalid outgoing auth header");
        }
    }
    headers
}

#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<FetchedToken, String>;
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Cached bearer token with single-flight refresh.
pub struct TokenClient {
    fetcher: Box<dyn TokenFetcher>,
    cached: Mutex<Option<CachedToken>>,
    refresh: tokio::sync::Mutex<()>,
    expiry_buffer: Duration,
}

impl TokenClient {
    pub fn new(fetcher: Box<dyn TokenFetcher>) -> Self {
        Self::with_buffer(fetcher, Duration::from_secs(DEFAULT_TOKEN_EXPIRY_BUFFER_SECS))
    }

    pub fn with_buffer(fetcher: Box<dyn TokenFetcher>, expiry_buffer: Duration) -> Self {
        Self {
            fetcher,
            cached: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
            expiry_buffer,
        }
    }

    fn valid_token(&self) -> Option<String> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|c| Instant::now() < c.expires_at)
            .map(|c| c.token.clone())
    }

    /// Current bearer token, refreshing if needed. `None` means the fetch
    /// failed and the caller should proceed without an Authorization header.
    pub async fn bearer(&self) -> Option<String> {
        if let Some(token) = self.valid_token() {
            return Some(token);
        }

        // Single flight: the first caller refreshes, the rest wait and then
        // reuse the fresh token from the cache.
        let _guard = self.refresh.lock().await;
        if let Some(token) = self.valid_token() {
            return Some(token);
        }

        match self.fetcher.fetch().await {
            Ok(fetched) => {
                let effective = fetched.expires_in.saturating_sub(self.expiry_buffer);
                let token = fetched.access_token.clone();
                *self.cached.lock() = Some(CachedToken {
                    token: fetched.access_token,
                    expires_at: Instant::now() + effective,
                });
                Some(token)
            }
            Err(e) => {
                tracing::warn!(error = %e, "token fetch failed; proceeding without bearer");
                None
            }
        }
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

struct HttpTokenFetcher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(&self) -> Result<FetchedToken, String> {
        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
        ];
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| format!("token endpoint unreachable: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("token endpoint returned {status}"));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| format!("token endpoint body: {e}"))?;
        Ok(FetchedToken {
            access_token: body.access_token,
            expires_in: Duration::from_secs(body.expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingFetcher {
        calls: Arc<AtomicU64>,
        expires_in: Duration,
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<FetchedToken, String> {
            // Hold the single-flight guard long enough for every concurrent
            // caller to pile up behind it.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(FetchedToken {
                access_token: format!("tok-{n}"),
                expires_in: self.expires_in,
            })
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl TokenFetcher for FailingFetcher {
        async fn fetch(&self) -> Result<FetchedToken, String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn concurrent_refresh_is_single_flight() {
        let calls = Arc::new(AtomicU64::new(0));
        let client = Arc::new(TokenClient::with_buffer(
            Box::new(CountingFetcher {
                calls: calls.clone(),
                expires_in: Duration::from_secs(600),
            }),
            Duration::from_secs(30),
        ));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.bearer().await })
            })
            .collect();

        for h in handles {
            assert_eq!(h.await.unwrap().as_deref(), Some("tok-1"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_buffer() {
        let calls = Arc::new(AtomicU64::new(0));
        let client = TokenClient::with_buffer(
            Box::new(CountingFetcher {
                calls: calls.clone(),
                expires_in: Duration::from_secs(600),
            }),
            Duration::from_secs(30),
        );
        assert!(client.bearer().await.is_some());
        assert!(client.bearer().await.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_triggers_refresh() {
        let calls = Arc::new(AtomicU64::new(0));
        let client = TokenClient::with_buffer(
            Box::new(CountingFetcher {
                calls: calls.clone(),
                // Shorter than the buffer: effectively instantly stale.
                expires_in: Duration::from_secs(1),
            }),
            Duration::from_secs(30),
        );
        assert_eq!(client.bearer().await.as_deref(), Some("tok-1"));
        assert_eq!(client.bearer().await.as_deref(), Some("tok-2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_failure_yields_no_bearer() {
        let client = TokenClient::new(Box::new(FailingFetcher));
        assert!(client.bearer().await.is_none());
    }

    #[test]
    fn static_headers_skip_invalid_names() {
        let mut raw = BTreeMap::new();
        raw.insert("X-Api-Key".to_string(), "abc".to_string());
        raw.insert("bad header name".to_string(), "x".to_string());
        let headers = build_static_headers(&raw);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-api-key").unwrap(), "abc");
    }
}
