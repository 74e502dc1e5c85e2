//! Versioned management REST API.
//!
//! Read endpoints expose the bridge's observation surface; the two write
//! endpoints (reload, reconnect) drive the reload coordinator and client
//! manager. An optional static token guards everything under `/api/v1`.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use manifold_bridge::Bridge;
use manifold_bridge::capability::CapabilityKind;
use manifold_bridge::registry::ListFilter;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ManagementState {
    pub bridge: Arc<Bridge>,
    pub config_path: PathBuf,
    pub management_token: Option<String>,
}

pub fn router(state: Arc<ManagementState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(|| async { "ready" }))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/capabilities", get(get_capabilities))
        .route("/api/v1/events", get(get_events))
        .route("/api/v1/reload", post(post_reload))
        .route("/api/v1/backends/{name}/reconnect", post(post_reconnect))
        .with_state(state)
}

fn authorize(state: &ManagementState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.management_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid management token").into_response())
    }
}

async fn get_status(
    State(state): State<Arc<ManagementState>>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    Ok(Json(state.bridge.status_snapshot()).into_response())
}

#[derive(serde::Deserialize, Default)]
struct CapabilitiesQuery {
    kind: Option<String>,
    backend: Option<String>,
    group: Option<String>,
}

async fn get_capabilities(
    State(state): State<Arc<ManagementState>>,
    headers: HeaderMap,
    Query(query): Query<CapabilitiesQuery>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;

    let kind = match query.kind.as_deref() {
        None => None,
        Some(raw) => Some(CapabilityKind::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unknown capability kind '{raw}'"),
            )
                .into_response()
        })?),
    };

    let filter = ListFilter {
        kind,
        backend: query.backend,
        group: query.group,
    };
    Ok(Json(state.bridge.capabilities_snapshot(&filter)).into_response())
}

#[derive(serde::Deserialize, Default)]
struct EventsQuery {
    /// RFC 3339 lower bound on event timestamps.
    since: Option<String>,
    max: Option<usize>,
    /// Event kind filter, e.g. `auth_failure` or `mcp_operation`.
    kind: Option<String>,
}

async fn get_events(
    State(state): State<Arc<ManagementState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;

    let since = match query.since.as_deref() {
        None => None,
        Some(raw) => Some(
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&chrono::Utc))
                .map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("bad since timestamp: {e}"))
                        .into_response()
                })?,
        ),
    };
    let max = query.max.unwrap_or(100).min(1000);
    let mut events = state.bridge.events_tail(since, max);
    if let Some(kind) = &query.kind {
        events.retain(|e| {
            serde_json::to_value(e.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .as_deref()
                == Some(kind.as_str())
        });
    }
    Ok(Json(events).into_response())
}

async fn post_reload(
    State(state): State<Arc<ManagementState>>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;

    let bytes = tokio::fs::read(&state.config_path).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("read config {}: {e}", state.config_path.display()),
        )
            .into_response()
    })?;
    let new_config: manifold_bridge::BridgeConfig =
        serde_yaml::from_slice(&bytes).map_err(|e| {
            (StatusCode::BAD_REQUEST, format!("parse config: {e}")).into_response()
        })?;

    match state.bridge.reload(new_config).await {
        Ok(report) => Ok(Json(report).into_response()),
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string()).into_response()),
    }
}

async fn post_reconnect(
    State(state): State<Arc<ManagementState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;

    match state.bridge.reconnect(&name).await {
        Ok(report) => Ok(Json(report).into_response()),
        Err(e) => Err((StatusCode::NOT_FOUND, e.to_string()).into_response()),
    }
}
