//! Northbound MCP endpoints: streamable HTTP (`/mcp`) and SSE
//! (`/sse` + `/messages`).
//!
//! Both transports parse JSON-RPC, create upstream sessions on
//! `initialize`, serve list replies from the session's frozen route-map
//! snapshot, and push call methods through the bridge's middleware
//! pipeline.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response, sse},
    routing::{get, post},
};
use futures::StreamExt as _;
use manifold_bridge::capability::{CapabilityDetail, CapabilityKind};
use manifold_bridge::registry::RouteMaps;
use manifold_bridge::sessions::{UpstreamSession, UpstreamTransport};
use manifold_bridge::{Bridge, BridgeError, McpMethod, RequestContext};
use manifold_wire as wire;
use manifold_wire::types::{
    Implementation, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    Prompt, Resource, Tool,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const SESSION_ID_HEADER: &str = "mcp-session-id";
const MAX_POST_BODY_BYTES: usize = 4 * 1024 * 1024;
const SSE_CHANNEL_CAPACITY: usize = 64;

pub struct McpState {
    bridge: Arc<Bridge>,
    /// Live SSE channels, keyed by upstream session id.
    sse_hub: Mutex<HashMap<String, mpsc::Sender<sse::Event>>>,
    /// Cancellation handles for in-flight calls, keyed by
    /// `session-id:request-id`.
    inflight: Mutex<HashMap<String, tokio_util::sync::CancellationToken>>,
}

impl McpState {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            sse_hub: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn cancel_inflight(&self, session_id: &str, request_id: &str) {
        if let Some(token) = self
            .inflight
            .lock()
            .get(&format!("{session_id}:{request_id}"))
        {
            token.cancel();
        }
    }
}

/// Honor a client-sent `notifications/cancelled` for one of this session's
/// in-flight calls.
fn handle_notification(state: &McpState, session_id: &str, notification: &wire::Notification) {
    if notification.method != "notifications/cancelled" {
        return;
    }
    let Some(request_id) = notification
        .params
        .as_ref()
        .and_then(|p| p.get("requestId"))
    else {
        return;
    };
    let request_id = match request_id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    state.cancel_inflight(session_id, &request_id);
}

pub fn router(state: Arc<McpState>) -> Router {
    Router::new()
        .route("/mcp", post(post_mcp).delete(delete_mcp))
        .route("/sse", get(get_sse))
        .route("/messages", post(post_messages))
        .route("/health", get(|| async { "ok" }))
        // Hard cap to protect the process from unbounded request bodies.
        .layer(DefaultBodyLimit::max(MAX_POST_BODY_BYTES))
        .with_state(state)
}

fn bearer_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: wire::PROTOCOL_VERSION.to_string(),
        capabilities: serde_json::json!({
            "tools": { "listChanged": true },
            "resources": {},
            "prompts": {},
        }),
        server_info: Implementation {
            name: "manifold-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        instructions: None,
    }
}

fn error_response(id: wire::RequestId, err: &BridgeError) -> wire::Response {
    wire::Response::err(
        id,
        wire::ErrorObject {
            code: err.wire_code(),
            message: err.to_string(),
            data: Some(serde_json::json!({
                "kind": err.kind().as_str(),
                "retryable": err.retryable(),
            })),
        },
    )
}

// ── Streamable HTTP ───────────────────────────────────────────────────

async fn post_mcp(
    State(state): State<Arc<McpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match wire::Message::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON-RPC body: {e}"))
                .into_response();
        }
    };
    let bearer = bearer_of(&headers);
    let client_addr = Some(addr.to_string());
    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match message {
        wire::Message::Notification(n) => {
            if let Some(sid) = &session_header {
                handle_notification(&state, sid, &n);
            }
            StatusCode::ACCEPTED.into_response()
        }
        wire::Message::Response(_) => {
            (StatusCode::BAD_REQUEST, "unexpected response message").into_response()
        }
        wire::Message::Request(req) if req.method == "initialize" => {
            match state
                .bridge
                .authenticate(bearer.as_deref(), None, client_addr.as_deref())
                .await
            {
                Ok(identity) => {
                    let session_id = Uuid::new_v4().to_string();
                    state.bridge.tracker().create(
                        &session_id,
                        UpstreamTransport::StreamableHttp,
                        &identity.subject,
                        state.bridge.current_snapshot(),
                    );
                    let result = serde_json::to_value(initialize_result()).unwrap_or_default();
                    let mut response = Json(wire::Response::ok(req.id, result)).into_response();
                    if let Ok(v) = session_id.parse::<axum::http::HeaderValue>() {
                        response.headers_mut().insert(SESSION_ID_HEADER, v);
                    }
                    response
                }
                Err(err) => Json(error_response(req.id, &err)).into_response(),
            }
        }
        wire::Message::Request(req) => {
            let Some(session_id) = session_header else {
                return (StatusCode::BAD_REQUEST, "missing mcp-session-id header")
                    .into_response();
            };
            let Some(session) = state.bridge.tracker().touch(&session_id) else {
                return (StatusCode::NOT_FOUND, "unknown or expired session").into_response();
            };
            let response =
                handle_session_request(&state, &session, bearer, client_addr, req).await;
            Json(response).into_response()
        }
    }
}

async fn delete_mcp(State(state): State<Arc<McpState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id header").into_response();
    };
    if state.bridge.tracker().remove(session_id) {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::NOT_FOUND, "unknown session").into_response()
    }
}

// ── SSE ───────────────────────────────────────────────────────────────

/// Removes the hub entry when the client's event stream goes away.
struct HubGuard {
    state: Arc<McpState>,
    session_id: String,
}

impl Drop for HubGuard {
    fn drop(&mut self) {
        self.state.sse_hub.lock().remove(&self.session_id);
        self.state.bridge.tracker().remove(&self.session_id);
    }
}

async fn get_sse(
    State(state): State<Arc<McpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let bearer = bearer_of(&headers);
    let client_addr = addr.to_string();
    let identity = match state
        .bridge
        .authenticate(bearer.as_deref(), None, Some(client_addr.as_str()))
        .await
    {
        Ok(identity) => identity,
        Err(err) => return (StatusCode::UNAUTHORIZED, err.to_string()).into_response(),
    };

    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<sse::Event>(SSE_CHANNEL_CAPACITY);
    state
        .sse_hub
        .lock()
        .insert(session_id.clone(), tx);
    state.bridge.tracker().create(
        &session_id,
        UpstreamTransport::Sse,
        &identity.subject,
        state.bridge.current_snapshot(),
    );

    let endpoint = sse::Event::default()
        .event("endpoint")
        .data(format!("/messages?session={session_id}"));

    let guard = HubGuard {
        state: state.clone(),
        session_id,
    };
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(endpoint) }).chain(
        tokio_stream_from(rx, guard).map(Ok::<_, Infallible>),
    );

    sse::Sse::new(stream)
        .keep_alive(sse::KeepAlive::default())
        .into_response()
}

/// Receiver stream that carries the hub guard until the client disconnects.
fn tokio_stream_from(
    mut rx: mpsc::Receiver<sse::Event>,
    guard: HubGuard,
) -> impl futures::Stream<Item = sse::Event> {
    futures::stream::poll_fn(move |cx| {
        // Keep the guard alive for the lifetime of the stream.
        let _ = &guard;
        rx.poll_recv(cx)
    })
}

#[derive(serde::Deserialize)]
struct MessagesQuery {
    session: String,
}

async fn post_messages(
    State(state): State<Arc<McpState>>,
    Query(query): Query<MessagesQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session) = state.bridge.tracker().touch(&query.session) else {
        return (StatusCode::NOT_FOUND, "unknown or expired session").into_response();
    };
    let tx = state.sse_hub.lock().get(&query.session).cloned();
    let Some(tx) = tx else {
        return (StatusCode::GONE, "event stream closed").into_response();
    };

    let message = match wire::Message::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON-RPC body: {e}"))
                .into_response();
        }
    };
    let bearer = bearer_of(&headers);
    let client_addr = Some(addr.to_string());

    match message {
        wire::Message::Notification(n) => {
            handle_notification(&state, &query.session, &n);
            StatusCode::ACCEPTED.into_response()
        }
        wire::Message::Response(_) => {
            (StatusCode::BAD_REQUEST, "unexpected response message").into_response()
        }
        wire::Message::Request(req) => {
            let response = if req.method == "initialize" {
                let result = serde_json::to_value(initialize_result()).unwrap_or_default();
                wire::Response::ok(req.id, result)
            } else {
                handle_session_request(&state, &session, bearer, client_addr, req).await
            };

            let event = match serde_json::to_string(&response) {
                Ok(json) => sse::Event::default().event("message").data(json),
                Err(e) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
                }
            };
            if tx.send(event).await.is_err() {
                return (StatusCode::GONE, "event stream closed").into_response();
            }
            StatusCode::ACCEPTED.into_response()
        }
    }
}

// ── Shared request handling ───────────────────────────────────────────

async fn handle_session_request(
    state: &McpState,
    session: &Arc<UpstreamSession>,
    bearer: Option<String>,
    client_addr: Option<String>,
    req: wire::Request,
) -> wire::Response {
    match req.method.as_str() {
        "ping" => wire::Response::ok(req.id, serde_json::json!({})),

        "tools/list" | "resources/list" | "prompts/list" => {
            // List replies come from the session's frozen snapshot so the
            // client sees a stable catalog for the whole conversation.
            match state
                .bridge
                .authenticate(bearer.as_deref(), Some(&session.id), client_addr.as_deref())
                .await
            {
                Ok(_) => {
                    let result = list_result(&req.method, &session.snapshot());
                    wire::Response::ok(req.id, result)
                }
                Err(err) => error_response(req.id, &err),
            }
        }

        "tools/call" | "resources/read" | "prompts/get" => {
            dispatch_call(state, session, bearer, client_addr, req).await
        }

        other => wire::Response::err(
            req.id,
            wire::ErrorObject {
                code: wire::CODE_METHOD_NOT_FOUND,
                message: format!("method '{other}' not supported"),
                data: None,
            },
        ),
    }
}

async fn dispatch_call(
    state: &McpState,
    session: &Arc<UpstreamSession>,
    bearer: Option<String>,
    client_addr: Option<String>,
    req: wire::Request,
) -> wire::Response {
    let (method, capability, arguments) = match parse_call(state, &req) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(req.id, &err),
    };

    let deadline = tokio::time::Instant::now()
        + manifold_bridge::config::BackendTimeouts::default().call();
    let mut ctx = RequestContext::new(method, capability, deadline);
    ctx.arguments = arguments;
    ctx.session_id = Some(session.id.clone());
    ctx.client_addr = client_addr;
    ctx.bearer = bearer;

    // Register the in-flight call so a client `notifications/cancelled`
    // can reach it.
    let inflight_key = format!("{}:{}", session.id, req.id);
    state
        .inflight
        .lock()
        .insert(inflight_key.clone(), ctx.cancel.clone());

    let result = state.bridge.dispatch(&mut ctx).await;
    state.inflight.lock().remove(&inflight_key);

    match result {
        Ok(value) => wire::Response::ok(req.id, value),
        Err(err) => error_response(req.id, &err),
    }
}

/// Extract `(method, exposed capability name, arguments)` from a call
/// request. Resource reads arrive addressed by URI and are translated back
/// to the exposed resource name the route map is keyed by.
fn parse_call(
    state: &McpState,
    req: &wire::Request,
) -> Result<(McpMethod, String, Option<Value>), BridgeError> {
    let params = req.params.clone().unwrap_or(Value::Null);
    match req.method.as_str() {
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::InvalidRequest("tools/call requires name".into()))?;
            Ok((
                McpMethod::CallTool,
                name.to_string(),
                params.get("arguments").cloned(),
            ))
        }
        "resources/read" => {
            let uri = params
                .get("uri")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::InvalidRequest("resources/read requires uri".into()))?;
            let snapshot = state.bridge.current_snapshot();
            let exposed = resolve_resource_name(&snapshot, uri)
                .ok_or_else(|| BridgeError::CapabilityNotFound(format!("resource:{uri}")))?;
            Ok((McpMethod::ReadResource, exposed, None))
        }
        "prompts/get" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::InvalidRequest("prompts/get requires name".into()))?;
            Ok((
                McpMethod::GetPrompt,
                name.to_string(),
                params.get("arguments").cloned(),
            ))
        }
        other => Err(BridgeError::InvalidRequest(format!(
            "unsupported method '{other}'"
        ))),
    }
}

/// Clients address resources by URI; the route map is keyed by exposed
/// name. Accept either.
fn resolve_resource_name(snapshot: &RouteMaps, uri: &str) -> Option<String> {
    for record in snapshot.list(CapabilityKind::Resource) {
        if record.exposed_name == uri {
            return Some(record.exposed_name.clone());
        }
        if let CapabilityDetail::Resource { uri: record_uri, .. } = &record.detail
            && record_uri == uri
        {
            return Some(record.exposed_name.clone());
        }
    }
    None
}

pub(crate) fn list_result(method: &str, snapshot: &RouteMaps) -> Value {
    match method {
        "tools/list" => {
            let tools: Vec<Tool> = snapshot
                .list(CapabilityKind::Tool)
                .map(|r| Tool {
                    name: r.exposed_name.clone(),
                    description: r.description.clone(),
                    input_schema: match &r.detail {
                        CapabilityDetail::Tool { input_schema } => input_schema.clone(),
                        _ => serde_json::json!({"type": "object"}),
                    },
                })
                .collect();
            serde_json::to_value(ListToolsResult {
                tools,
                next_cursor: None,
            })
            .unwrap_or_default()
        }
        "resources/list" => {
            let resources: Vec<Resource> = snapshot
                .list(CapabilityKind::Resource)
                .map(|r| {
                    let (uri, mime_type) = match &r.detail {
                        CapabilityDetail::Resource { uri, mime_type } => {
                            (uri.clone(), mime_type.clone())
                        }
                        _ => (String::new(), None),
                    };
                    Resource {
                        uri,
                        name: r.exposed_name.clone(),
                        description: r.description.clone(),
                        mime_type,
                    }
                })
                .collect();
            serde_json::to_value(ListResourcesResult {
                resources,
                next_cursor: None,
            })
            .unwrap_or_default()
        }
        _ => {
            let prompts: Vec<Prompt> = snapshot
                .list(CapabilityKind::Prompt)
                .map(|r| Prompt {
                    name: r.exposed_name.clone(),
                    description: r.description.clone(),
                    arguments: match &r.detail {
                        CapabilityDetail::Prompt { arguments } => arguments.clone(),
                        _ => Vec::new(),
                    },
                })
                .collect();
            serde_json::to_value(ListPromptsResult {
                prompts,
                next_cursor: None,
            })
            .unwrap_or_default()
        }
    }
}
