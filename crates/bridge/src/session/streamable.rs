//! Streamable HTTP transport: one POST per JSON-RPC message.
//!
//! The server may answer a POST with a single JSON body or with a short SSE
//! stream that eventually carries the correlated response. A server-assigned
//! session id arrives in a response header on `initialize` and is echoed on
//! every subsequent request.

use super::rpc::{self, CallGate};
use super::{BackendSession, OutgoingAuth, SessionError, take_result_for};
use crate::config::HttpConnect;
use async_trait::async_trait;
use futures::StreamExt as _;
use manifold_wire as wire;
use manifold_wire::SseDecoder;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::time::Instant;

const SESSION_ID_HEADER: &str = "mcp-session-id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

pub struct StreamableHttpSession {
    name: String,
    url: String,
    base_headers: HeaderMap,
    auth: OutgoingAuth,
    http: reqwest::Client,
    gate: CallGate,
    next_id: AtomicI64,
    session_id: parking_lot::RwLock<Option<String>>,
    closed: AtomicBool,
}

impl StreamableHttpSession {
    pub fn new(
        name: &str,
        connect: &HttpConnect,
        auth: OutgoingAuth,
        http: reqwest::Client,
        max_outstanding: usize,
    ) -> Arc<dyn BackendSession> {
        Arc::new(Self {
            name: name.to_string(),
            url: connect.url.clone(),
            base_headers: static_headers(&connect.headers),
            auth,
            http,
            gate: CallGate::new(max_outstanding),
            next_id: AtomicI64::new(0),
            session_id: parking_lot::RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    async fn headers(&self) -> HeaderMap {
        let mut headers = self.base_headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_BOTH));
        let sid = self.session_id.read().clone();
        if let Some(sid) = sid
            && let Ok(v) = HeaderValue::from_str(&sid)
        {
            headers.insert(SESSION_ID_HEADER, v);
        }
        self.auth.apply(&mut headers).await;
        headers
    }

    fn capture_session_id(&self, headers: &HeaderMap) {
        if let Some(sid) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) {
            let mut guard = self.session_id.write();
            if guard.as_deref() != Some(sid) {
                *guard = Some(sid.to_string());
            }
        }
    }

    async fn post(
        &self,
        body: &impl serde::Serialize,
        deadline: Instant,
    ) -> Result<reqwest::Response, SessionError> {
        let started = Instant::now();
        let headers = self.headers().await;
        let fut = self.http.post(&self.url).headers(headers).json(body).send();
        let resp = match tokio::time::timeout_at(deadline, fut).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(SessionError::Transport(format!("http: {e}"))),
            Err(_) => {
                return Err(SessionError::Timeout {
                    elapsed_ms: rpc::duration_ms(started.elapsed()),
                });
            }
        };
        self.capture_session_id(resp.headers());
        Ok(resp)
    }

    /// Drain an SSE reply body until the response for `id` shows up.
    async fn read_sse_reply(
        &self,
        resp: reqwest::Response,
        id: &wire::RequestId,
        deadline: Instant,
        started: Instant,
    ) -> Result<Value, SessionError> {
        let mut decoder = SseDecoder::new();
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    return Err(SessionError::Transport(format!("sse body: {e}")));
                }
                Ok(None) => {
                    return Err(SessionError::InvalidResponse(
                        "sse reply ended without a response".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(SessionError::Timeout {
                        elapsed_ms: rpc::duration_ms(started.elapsed()),
                    });
                }
            };

            let text = String::from_utf8_lossy(&chunk);
            for event in decoder.feed(&text) {
                if event.data.trim().is_empty() {
                    continue;
                }
                let msg = wire::Message::from_str(&event.data).map_err(|e| {
                    SessionError::InvalidResponse(format!("sse event payload: {e}"))
                })?;
                if let Some(result) = take_result_for(msg, id) {
                    return result;
                }
            }
        }
    }
}

#[async_trait]
impl BackendSession for StreamableHttpSession {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let _permit = self.gate.acquire(deadline).await?;
        let started = Instant::now();

        let id = wire::RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let req = wire::Request::new(id.clone(), method, params);
        let resp = self.post(&req, deadline).await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SessionError::Transport(format!(
                "unexpected status {status}"
            )));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            return self.read_sse_reply(resp, &id, deadline, started).await;
        }

        let bytes = match tokio::time::timeout_at(deadline, resp.bytes()).await {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => return Err(SessionError::Transport(format!("read body: {e}"))),
            Err(_) => {
                return Err(SessionError::Timeout {
                    elapsed_ms: rpc::duration_ms(started.elapsed()),
                });
            }
        };
        let msg = wire::Message::from_slice(&bytes)
            .map_err(|e| SessionError::InvalidResponse(format!("response body: {e}")))?;
        take_result_for(msg, &id).unwrap_or_else(|| {
            Err(SessionError::InvalidResponse(
                "response id does not match request".to_string(),
            ))
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let notif = wire::Notification::new(method, params);
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let resp = self.post(&notif, deadline).await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SessionError::Transport(format!(
                "notification rejected with {status}"
            )))
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Best-effort: tell the server to drop its session state.
        let sid = self.session_id.read().clone();
        if let Some(sid) = sid
            && let Ok(v) = HeaderValue::from_str(&sid)
        {
            let mut headers = self.base_headers.clone();
            headers.insert(SESSION_ID_HEADER, v);
            self.auth.apply(&mut headers).await;
            if let Err(e) = self.http.delete(&self.url).headers(headers).send().await {
                tracing::debug!(backend = %self.name, error = %e, "session delete failed");
            }
        }
    }
}

fn static_headers(raw: &std::collections::BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (k, v) in raw {
        if let Ok(name) = HeaderName::from_bytes(k.as_bytes())
            && let Ok(value) = HeaderValue::from_str(v)
        {
            headers.insert(name, value);
        }
    }
    headers
}
