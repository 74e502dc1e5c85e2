//! End-to-end bridge behavior against in-memory backends.

mod common;

use common::{FakeConnector, FakeSpec, base_config, stdio_backend};
use manifold_bridge::audit::AuditKind;
use manifold_bridge::capability::CapabilityKind;
use manifold_bridge::config::{
    AuthorizationConfig, ConflictStrategy, IncomingAuthConfig, KindFilter, PolicyConfig,
    PolicyEffect,
};
use manifold_bridge::manager::reason;
use manifold_bridge::{Bridge, ErrorKind, McpMethod, RequestContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn specs(entries: &[(&str, &[&str])]) -> Vec<(String, FakeSpec)> {
    entries
        .iter()
        .map(|(name, tools)| {
            (
                (*name).to_string(),
                FakeSpec {
                    tools: tools.iter().map(|t| (*t).to_string()).collect(),
                    ..FakeSpec::default()
                },
            )
        })
        .collect()
}

fn ctx(capability: &str) -> RequestContext {
    RequestContext::new(
        McpMethod::CallTool,
        capability,
        Instant::now() + Duration::from_secs(5),
    )
}

#[tokio::test]
async fn prefix_strategy_resolves_collisions() {
    let connector = FakeConnector::new(specs(&[
        ("gh", &["search", "issues"]),
        ("jira", &["search"]),
    ]));
    let config = base_config(
        vec![stdio_backend("gh"), stdio_backend("jira")],
        ConflictStrategy::Prefix,
    );
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector.clone()).unwrap();
    bridge.start().await;

    let snapshot = bridge.current_snapshot();
    let tools = snapshot.map_for(CapabilityKind::Tool);
    assert!(tools.contains_key("gh_search"));
    assert!(tools.contains_key("jira_search"));
    assert!(tools.contains_key("gh_issues"));
    assert!(!tools.contains_key("search"));

    // Calls restore the original name on each side.
    let mut gh_ctx = ctx("gh_search");
    bridge.dispatch(&mut gh_ctx).await.unwrap();
    let mut jira_ctx = ctx("jira_search");
    bridge.dispatch(&mut jira_ctx).await.unwrap();

    let gh_calls = connector.calls_to("gh");
    assert_eq!(gh_calls.len(), 1);
    assert_eq!(gh_calls[0].1["name"], "search");
    let jira_calls = connector.calls_to("jira");
    assert_eq!(jira_calls.len(), 1);
    assert_eq!(jira_calls[0].1["name"], "search");
}

#[tokio::test]
async fn deny_overrides_allow_end_to_end() {
    let connector = FakeConnector::new(specs(&[(
        "gh",
        &["search_web", "search_internal", "foo"],
    )]));
    let mut backend = stdio_backend("gh");
    backend.filters.tools = KindFilter {
        allow: vec!["search_*".to_string()],
        deny: vec!["search_internal".to_string()],
    };
    let config = base_config(vec![backend], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let snapshot = bridge.current_snapshot();
    let tools = snapshot.map_for(CapabilityKind::Tool);
    assert!(tools.contains_key("search_web"));
    assert!(!tools.contains_key("search_internal"));
    assert!(!tools.contains_key("foo"));
    assert_eq!(tools.len(), 1);
}

#[tokio::test]
async fn rbac_default_deny_rejects_before_backend() {
    let connector = FakeConnector::new(specs(&[("gh", &["anything"])]));
    let mut config = base_config(vec![stdio_backend("gh")], ConflictStrategy::FirstWins);
    config.incoming_auth = IncomingAuthConfig::Local {
        token: "viewer-token".to_string(),
        roles: vec!["viewer".to_string()],
    };
    config.authorization = AuthorizationConfig {
        enabled: true,
        default_effect: PolicyEffect::Deny,
        policies: vec![PolicyConfig {
            effect: PolicyEffect::Allow,
            roles: vec!["admin".to_string()],
            resources: vec!["*".to_string()],
        }],
    };
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector.clone()).unwrap();
    bridge.start().await;

    let mut call = ctx("anything");
    call.bearer = Some("viewer-token".to_string());
    let err = bridge.dispatch(&mut call).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(err.wire_code(), -32002);

    // No backend call happened.
    assert!(connector.calls_to("gh").is_empty());

    // Exactly one auth_failure for the request, and no mcp_operation.
    let events = bridge.events_tail(None, 1000);
    let auth_failures = events
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::AuthFailure))
        .count();
    let operations = events
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::McpOperation))
        .count();
    assert_eq!(auth_failures, 1);
    assert_eq!(operations, 0);
}

#[tokio::test]
async fn failed_backend_routes_disappear() {
    let connector = FakeConnector::new(specs(&[("gh", &["search"]), ("jira", &["boards"])]));
    let config = base_config(
        vec![stdio_backend("gh"), stdio_backend("jira")],
        ConflictStrategy::FirstWins,
    );
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    assert!(
        bridge
            .registry()
            .resolve(CapabilityKind::Tool, "search")
            .is_some()
    );

    bridge
        .manager()
        .fail_backend("gh", reason::HEALTH_FAILED, "3 consecutive probe failures")
        .await;

    let snapshot = bridge.current_snapshot();
    assert!(snapshot.resolve(CapabilityKind::Tool, "search").is_none());
    // The healthy backend keeps its routes.
    assert!(snapshot.resolve(CapabilityKind::Tool, "boards").is_some());

    let err = bridge.dispatch(&mut ctx("search")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapabilityNotFound);
    assert_eq!(err.wire_code(), -32601);
}

#[tokio::test]
async fn reload_adds_and_removes() {
    let connector = FakeConnector::new(specs(&[
        ("a", &["a_tool"]),
        ("b", &["b_tool"]),
        ("c", &["c_tool"]),
    ]));
    let config = base_config(
        vec![stdio_backend("a"), stdio_backend("b")],
        ConflictStrategy::FirstWins,
    );
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector.clone()).unwrap();
    bridge.start().await;

    let b_session_before = bridge.manager().session("b").unwrap();

    let new_config = base_config(
        vec![stdio_backend("b"), stdio_backend("c")],
        ConflictStrategy::FirstWins,
    );
    let report = bridge.reload(new_config).await.unwrap();

    assert_eq!(report.added, vec!["c".to_string()]);
    assert_eq!(report.removed, vec!["a".to_string()]);
    assert!(report.changed.is_empty());
    assert!(report.errors.is_empty());

    // One start each for a, b, c; nothing restarted.
    assert_eq!(connector.connect_count("a"), 1);
    assert_eq!(connector.connect_count("b"), 1);
    assert_eq!(connector.connect_count("c"), 1);

    // b's session object is untouched.
    let b_session_after = bridge.manager().session("b").unwrap();
    assert!(Arc::ptr_eq(&b_session_before, &b_session_after));

    let snapshot = bridge.current_snapshot();
    assert!(snapshot.resolve(CapabilityKind::Tool, "a_tool").is_none());
    assert!(snapshot.resolve(CapabilityKind::Tool, "b_tool").is_some());
    assert!(snapshot.resolve(CapabilityKind::Tool, "c_tool").is_some());
}

#[tokio::test]
async fn in_flight_call_survives_reload() {
    let connector = FakeConnector::new(vec![
        (
            "a".to_string(),
            FakeSpec {
                tools: vec!["a_tool".to_string()],
                ..FakeSpec::default()
            },
        ),
        (
            "b".to_string(),
            FakeSpec {
                tools: vec!["b_tool".to_string()],
                call_delay: Some(Duration::from_millis(200)),
                ..FakeSpec::default()
            },
        ),
        (
            "c".to_string(),
            FakeSpec {
                tools: vec!["c_tool".to_string()],
                ..FakeSpec::default()
            },
        ),
    ]);
    let config = base_config(
        vec![stdio_backend("a"), stdio_backend("b")],
        ConflictStrategy::FirstWins,
    );
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    // A slow call against the untouched backend, begun before the reload.
    let bridge_for_call = bridge.clone();
    let call = tokio::spawn(async move {
        let mut ctx = ctx("b_tool");
        bridge_for_call.dispatch(&mut ctx).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = bridge
        .reload(base_config(
            vec![stdio_backend("b"), stdio_backend("c")],
            ConflictStrategy::FirstWins,
        ))
        .await
        .unwrap();
    assert!(report.errors.is_empty());

    let result = call.await.unwrap().unwrap();
    assert_eq!(result["content"][0]["text"], "b:b_tool");
}

#[tokio::test]
async fn reload_restarts_changed_backends() {
    let connector = FakeConnector::new(specs(&[("a", &["a_tool"])]));
    let config = base_config(vec![stdio_backend("a")], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector.clone()).unwrap();
    bridge.start().await;

    let mut changed = stdio_backend("a");
    changed.group = "prod".to_string();
    let report = bridge
        .reload(base_config(vec![changed], ConflictStrategy::FirstWins))
        .await
        .unwrap();

    assert_eq!(report.changed, vec!["a".to_string()]);
    assert_eq!(connector.connect_count("a"), 2);
}

#[tokio::test]
async fn reconnect_coalesces_concurrent_calls() {
    let connector = FakeConnector::new(specs(&[("gh", &["search"])]));
    let config = base_config(vec![stdio_backend("gh")], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector.clone()).unwrap();
    bridge.start().await;
    assert_eq!(connector.connect_count("gh"), 1);

    let reports = futures::future::join_all(
        (0..5).map(|_| bridge.reconnect("gh")),
    )
    .await;

    let reconnected = reports
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.reconnected)
        .count();
    assert_eq!(reconnected, 1, "exactly one shutdown+start cycle");
    assert_eq!(connector.connect_count("gh"), 2);
}

#[tokio::test]
async fn call_respects_deadline_against_silent_backend() {
    let connector = FakeConnector::new(vec![(
        "slow".to_string(),
        FakeSpec {
            tools: vec!["stall".to_string()],
            hang_calls: true,
            ..FakeSpec::default()
        },
    )]);
    let config = base_config(vec![stdio_backend("slow")], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let deadline_ms: u64 = 200;
    let mut call = RequestContext::new(
        McpMethod::CallTool,
        "stall",
        Instant::now() + Duration::from_millis(deadline_ms),
    );
    let started = Instant::now();
    let err = bridge.dispatch(&mut call).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.wire_code(), -32005);
    assert!(
        elapsed <= Duration::from_millis(deadline_ms * 11 / 10 + 50),
        "timeout took {elapsed:?}, deadline {deadline_ms}ms"
    );
}

#[tokio::test]
async fn audit_records_one_outcome_per_request() {
    let connector = FakeConnector::new(specs(&[("gh", &["search"])]));
    let config = base_config(vec![stdio_backend("gh")], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    bridge.dispatch(&mut ctx("search")).await.unwrap();

    let events = bridge.events_tail(None, 1000);
    let with_outcome: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::McpOperation) && e.outcome.is_some())
        .collect();
    assert_eq!(with_outcome.len(), 1);
    let outcome = with_outcome[0].outcome.as_ref().unwrap();
    assert_eq!(outcome.status, "ok");
    assert!(outcome.latency_ms.is_some());
}

#[tokio::test]
async fn first_wins_drop_is_audited() {
    let connector = FakeConnector::new(specs(&[("gh", &["search"]), ("jira", &["search"])]));
    let config = base_config(
        vec![stdio_backend("gh"), stdio_backend("jira")],
        ConflictStrategy::FirstWins,
    );
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let snapshot = bridge.current_snapshot();
    let target = snapshot.resolve(CapabilityKind::Tool, "search").unwrap();
    assert_eq!(target.backend, "gh");

    let events = bridge.events_tail(None, 1000);
    let dropped: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::CapabilityDropped))
        .collect();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].target.backend.as_deref(), Some("jira"));
}

#[tokio::test]
async fn unauthenticated_call_is_rejected_and_audited() {
    let connector = FakeConnector::new(specs(&[("gh", &["search"])]));
    let mut config = base_config(vec![stdio_backend("gh")], ConflictStrategy::FirstWins);
    config.incoming_auth = IncomingAuthConfig::Local {
        token: "sekrit".to_string(),
        roles: vec![],
    };
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector.clone()).unwrap();
    bridge.start().await;

    let mut call = ctx("search");
    call.bearer = Some("wrong".to_string());
    let err = bridge.dispatch(&mut call).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    assert_eq!(err.wire_code(), -32001);
    assert!(connector.calls_to("gh").is_empty());

    let events = bridge.events_tail(None, 1000);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e.kind, AuditKind::AuthFailure))
            .count(),
        1
    );
}

#[tokio::test]
async fn health_probes_degrade_then_fail_a_backend() {
    let connector = FakeConnector::new(vec![
        (
            "gh".to_string(),
            FakeSpec {
                tools: vec!["search".to_string()],
                fail_ping: true,
                ..FakeSpec::default()
            },
        ),
        (
            "jira".to_string(),
            FakeSpec {
                tools: vec!["boards".to_string()],
                ..FakeSpec::default()
            },
        ),
    ]);
    let config = base_config(
        vec![stdio_backend("gh"), stdio_backend("jira")],
        ConflictStrategy::FirstWins,
    );
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let monitor = manifold_bridge::health::HealthMonitor::new(
        bridge.manager().clone(),
        &manifold_bridge::config::HealthConfig::default(),
    );

    use manifold_bridge::status::BackendPhase;

    // First failure crosses the degraded threshold; routes stay.
    monitor.probe_one("gh").await;
    assert_eq!(bridge.manager().phase("gh"), Some(BackendPhase::Degraded));
    assert!(
        bridge
            .registry()
            .resolve(CapabilityKind::Tool, "search")
            .is_some(),
        "degraded backends stay routable"
    );

    // Third consecutive failure crosses the failed threshold.
    monitor.probe_one("gh").await;
    monitor.probe_one("gh").await;
    assert_eq!(bridge.manager().phase("gh"), Some(BackendPhase::Failed));

    let snapshot = bridge.current_snapshot();
    assert!(snapshot.resolve(CapabilityKind::Tool, "search").is_none());
    assert!(snapshot.resolve(CapabilityKind::Tool, "boards").is_some());
}

#[tokio::test]
async fn single_probe_failure_degrades_with_degraded_reason() {
    let connector = FakeConnector::new(vec![(
        "gh".to_string(),
        FakeSpec {
            tools: vec!["search".to_string()],
            fail_ping: true,
            ..FakeSpec::default()
        },
    )]);
    let config = base_config(vec![stdio_backend("gh")], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let monitor = manifold_bridge::health::HealthMonitor::new(
        bridge.manager().clone(),
        &manifold_bridge::config::HealthConfig::default(),
    );
    monitor.probe_one("gh").await;

    use manifold_bridge::status::{BackendPhase, CONDITION_HEALTHY};
    assert_eq!(bridge.manager().phase("gh"), Some(BackendPhase::Degraded));

    // The condition carries the degraded reason, not the terminal one.
    let status = bridge.manager().snapshot();
    let gh = status.iter().find(|s| s.name == "gh").unwrap();
    let healthy = gh
        .conditions
        .iter()
        .find(|c| c.ctype == CONDITION_HEALTHY)
        .unwrap();
    assert!(!healthy.status);
    assert_eq!(healthy.reason, "health_degraded");

    let events = bridge.events_tail(None, 1000);
    let transition = events
        .iter()
        .find(|e| matches!(e.kind, AuditKind::BackendTransition) && e.meta["to"] == "degraded")
        .unwrap();
    assert_eq!(transition.meta["reason"], "health_degraded");
}

#[tokio::test]
async fn tool_override_renames_and_routes_by_original_name() {
    let connector = FakeConnector::new(specs(&[("gh", &["search"])]));
    let mut backend = stdio_backend("gh");
    backend.tool_overrides.insert(
        "search".to_string(),
        manifold_bridge::config::ToolOverride {
            name: Some("gh_web_search".to_string()),
            description: Some("Search GitHub".to_string()),
        },
    );
    let config = base_config(vec![backend], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector.clone()).unwrap();
    bridge.start().await;

    let snapshot = bridge.current_snapshot();
    assert!(snapshot.resolve(CapabilityKind::Tool, "search").is_none());
    let target = snapshot
        .resolve(CapabilityKind::Tool, "gh_web_search")
        .unwrap();
    assert_eq!(target.original_name, "search");

    bridge.dispatch(&mut ctx("gh_web_search")).await.unwrap();
    let calls = connector.calls_to("gh");
    assert_eq!(calls[0].1["name"], "search");
}

#[tokio::test]
async fn client_cancellation_is_honored_and_audited() {
    let connector = FakeConnector::new(vec![(
        "slow".to_string(),
        FakeSpec {
            tools: vec!["stall".to_string()],
            hang_calls: true,
            ..FakeSpec::default()
        },
    )]);
    let config = base_config(vec![stdio_backend("slow")], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let mut call = RequestContext::new(
        McpMethod::CallTool,
        "stall",
        Instant::now() + Duration::from_secs(30),
    );
    let cancel = call.cancel.clone();

    let bridge_for_task = bridge.clone();
    let handle = tokio::spawn(async move { bridge_for_task.dispatch(&mut call).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.wire_code(), -32800);

    let events = bridge.events_tail(None, 1000);
    let cancelled = events
        .iter()
        .filter(|e| {
            matches!(e.kind, AuditKind::McpOperation)
                && e.outcome.as_ref().is_some_and(|o| o.status == "cancelled")
        })
        .count();
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn recovery_converts_panics_into_internal_errors() {
    let connector = FakeConnector::new(vec![(
        "buggy".to_string(),
        FakeSpec {
            tools: vec!["explode".to_string()],
            panic_calls: true,
            ..FakeSpec::default()
        },
    )]);
    let config = base_config(vec![stdio_backend("buggy")], ConflictStrategy::FirstWins);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let mut call = ctx("explode");
    let err = bridge.dispatch(&mut call).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.wire_code(), -32603);
    // The wire message stays generic; the panic detail is preserved on the
    // context for the audit trail.
    assert!(!err.to_string().contains("wiring bug"));
    assert!(
        call.error_detail
            .as_deref()
            .is_some_and(|d| d.contains("wiring bug"))
    );
}

#[tokio::test]
async fn error_strategy_collision_keeps_previous_map_on_reload() {
    let connector = FakeConnector::new(specs(&[("gh", &["search"]), ("jira", &["search"])]));
    let config = base_config(vec![stdio_backend("gh")], ConflictStrategy::Error);
    let bridge = Bridge::with_connector(config, CancellationToken::new(), connector).unwrap();
    bridge.start().await;

    let before = bridge.current_snapshot();
    assert!(before.resolve(CapabilityKind::Tool, "search").is_some());

    // Adding a colliding backend under the error strategy must not publish
    // a partial map; the previous generation stays live.
    let report = bridge
        .reload(base_config(
            vec![stdio_backend("gh"), stdio_backend("jira")],
            ConflictStrategy::Error,
        ))
        .await
        .unwrap();
    assert_eq!(report.added, vec!["jira".to_string()]);
    assert!(
        report.errors.iter().any(|e| e.contains("conflict")),
        "fatal build error surfaces in the report: {:?}",
        report.errors
    );

    let after = bridge.current_snapshot();
    assert_eq!(after.version, before.version);
    assert_eq!(
        after.resolve(CapabilityKind::Tool, "search").unwrap().backend,
        "gh"
    );
}
