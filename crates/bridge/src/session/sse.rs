//! SSE transport: a long-lived GET event stream for server-to-client
//! messages plus per-request POSTs to an announced endpoint.
//!
//! The first event on the stream is the `endpoint` announcement; the
//! startup-delay timeout gates it. Responses arrive as `message` events and
//! are demultiplexed by request id in arrival order.

use super::rpc::{self, CallGate, RequestTracker};
use super::{BackendSession, OutgoingAuth, SessionError};
use crate::config::HttpConnect;
use async_trait::async_trait;
use futures::StreamExt as _;
use manifold_wire as wire;
use manifold_wire::SseDecoder;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct SseSession {
    name: String,
    endpoint: parking_lot::RwLock<Option<String>>,
    base_headers: HeaderMap,
    auth: OutgoingAuth,
    http: reqwest::Client,
    tracker: Arc<RequestTracker>,
    gate: CallGate,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SseSession {
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        name: &str,
        connect: &HttpConnect,
        auth: OutgoingAuth,
        http: reqwest::Client,
        max_outstanding: usize,
        startup_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        let cancel = shutdown.child_token();
        let tracker = Arc::new(RequestTracker::new());
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let session = Arc::new(Self {
            name: name.to_string(),
            endpoint: parking_lot::RwLock::new(None),
            base_headers: static_headers(&connect.headers),
            auth: auth.clone(),
            http: http.clone(),
            tracker: tracker.clone(),
            gate: CallGate::new(max_outstanding),
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(stream_task(
            name.to_string(),
            connect.url.clone(),
            session.base_headers.clone(),
            auth,
            http,
            tracker,
            endpoint_tx,
            cancel,
        ));

        // The endpoint announcement gates readiness.
        let endpoint = match tokio::time::timeout(startup_timeout, endpoint_rx).await {
            Ok(Ok(ep)) => ep,
            Ok(Err(_)) => {
                session.close().await;
                return Err(SessionError::Transport(
                    "event stream closed before endpoint announcement".to_string(),
                ));
            }
            Err(_) => {
                session.close().await;
                return Err(SessionError::Timeout {
                    elapsed_ms: rpc::duration_ms(startup_timeout),
                });
            }
        };

        let resolved = resolve_endpoint(&connect.url, &endpoint)?;
        *session.endpoint.write() = Some(resolved);
        Ok(session)
    }

    fn endpoint(&self) -> Result<String, SessionError> {
        self.endpoint
            .read()
            .clone()
            .ok_or_else(|| SessionError::Transport("endpoint not announced".to_string()))
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), SessionError> {
        let endpoint = self.endpoint()?;
        let mut headers = self.base_headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.auth.apply(&mut headers).await;

        let resp = self
            .http
            .post(&endpoint)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("post: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SessionError::Transport(format!(
                "post rejected with {status}"
            )))
        }
    }
}

#[async_trait]
impl BackendSession for SseSession {
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

        // Slot unregisters itself on drop; see `PendingRequest`.
        let mut pending = self.tracker.register();
        let req = wire::Request::new(wire::RequestId::Number(pending.id()), method, params);
        self.post(&req).await?;

        match rpc::await_response(&mut pending, deadline, started).await {
            Ok(v) => Ok(v),
            Err(err) => {
                if matches!(err, SessionError::Timeout { .. }) {
                    let cancel = wire::Notification::new(
                        "notifications/cancelled",
                        Some(serde_json::json!({ "requestId": pending.id() })),
                    );
                    let _ = self.post(&cancel).await;
                }
                Err(err)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        self.post(&wire::Notification::new(method, params)).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.tracker.fail_all(&SessionError::Closed);
        tracing::debug!(backend = %self.name, "event stream session closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_task(
    name: String,
    url: String,
    base_headers: HeaderMap,
    auth: OutgoingAuth,
    http: reqwest::Client,
    tracker: Arc<RequestTracker>,
    endpoint_tx: oneshot::Sender<String>,
    cancel: CancellationToken,
) {
    let mut headers = base_headers;
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    auth.apply(&mut headers).await;

    let resp = tokio::select! {
        () = cancel.cancelled() => return,
        res = http.get(&url).headers(headers).send() => res,
    };
    let resp = match resp {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            tracing::warn!(backend = %name, status = %r.status(), "event stream rejected");
            tracker.fail_all(&SessionError::Transport(format!(
                "event stream rejected with {}",
                r.status()
            )));
            return;
        }
        Err(e) => {
            tracing::warn!(backend = %name, error = %e, "event stream connect failed");
            tracker.fail_all(&SessionError::Transport(format!("connect: {e}")));
            return;
        }
    };

    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::new();
    let mut stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return,
            maybe = stream.next() => match maybe {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    tracker.fail_all(&SessionError::Transport(format!("stream: {e}")));
                    return;
                }
                None => {
                    tracker.fail_all(&SessionError::Transport(
                        "event stream ended".to_string(),
                    ));
                    return;
                }
            },
        };

        let text = String::from_utf8_lossy(&chunk);
        for event in decoder.feed(&text) {
            match event.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                }
                _ => match wire::Message::from_str(&event.data) {
                    Ok(wire::Message::Response(resp)) => {
                        let wire::RequestId::Number(id) = resp.id else {
                            continue;
                        };
                        let _ = tracker.complete(id, rpc::response_into_result(resp));
                    }
                    Ok(wire::Message::Notification(n)) => {
                        tracing::debug!(backend = %name, method = %n.method, "backend notification");
                    }
                    Ok(wire::Message::Request(_)) => {
                        tracing::debug!(backend = %name, "server-to-client request ignored");
                    }
                    Err(e) => {
                        tracing::warn!(backend = %name, error = %e, "bad event payload");
                    }
                },
            }
        }
    }
}

/// Endpoint announcements may be absolute or relative to the stream URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> Result<String, SessionError> {
    let base_url = reqwest::Url::parse(base)
        .map_err(|e| SessionError::Transport(format!("bad stream url: {e}")))?;
    let resolved = base_url
        .join(endpoint)
        .map_err(|e| SessionError::Transport(format!("bad endpoint '{endpoint}': {e}")))?;
    Ok(resolved.to_string())
}

fn static_headers(raw: &BTreeMap<String, String>) -> HeaderMap {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_endpoint_against_stream_url() {
        let out = resolve_endpoint("http://host:9000/sse", "/messages?session=1").unwrap();
        assert_eq!(out, "http://host:9000/messages?session=1");
    }

    #[test]
    fn keeps_absolute_endpoint() {
        let out = resolve_endpoint("http://host:9000/sse", "http://other/messages").unwrap();
        assert_eq!(out, "http://other/messages");
    }
}
