//! In-memory fake backends for end-to-end bridge tests.

use async_trait::async_trait;
use manifold_bridge::config::{
    AuditConfig, BackendConfig, BridgeConfig, ConflictResolutionConfig, ConflictStrategy,
    FilterRules, StdioConnect, TransportConfig,
};
use manifold_bridge::manager::SessionConnector;
use manifold_bridge::session::{BackendSession, SessionError, SessionLimits};
use manifold_wire as wire;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a fake backend exposes and how it behaves.
#[derive(Clone, Default)]
pub struct FakeSpec {
    pub tools: Vec<String>,
    /// Calls never complete; the session returns a timeout at the deadline.
    pub hang_calls: bool,
    /// Calls take this long before answering.
    pub call_delay: Option<Duration>,
    /// Pings fail with a transport error.
    pub fail_ping: bool,
    /// Calls panic, exercising the recovery layer.
    pub panic_calls: bool,
}

pub struct FakeSession {
    pub name: String,
    spec: FakeSpec,
    pub calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl BackendSession for FakeSession {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, SessionError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": wire::PROTOCOL_VERSION,
                "capabilities": {},
                "serverInfo": { "name": format!("fake-{}", self.name), "version": "0.0.0" },
            })),
            "tools/list" => Ok(json!({
                "tools": self.spec.tools.iter().map(|t| json!({
                    "name": t,
                    "description": format!("{t} tool"),
                    "inputSchema": { "type": "object" },
                })).collect::<Vec<_>>(),
            })),
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            "ping" => {
                if self.spec.fail_ping {
                    Err(SessionError::Transport("ping refused".to_string()))
                } else {
                    Ok(json!({}))
                }
            }
            "tools/call" => {
                assert!(
                    !self.spec.panic_calls,
                    "backend wiring bug injected for recovery tests"
                );
                let started = Instant::now();
                if self.spec.hang_calls {
                    tokio::time::sleep_until(deadline).await;
                    return Err(SessionError::Timeout {
                        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(0),
                    });
                }
                if let Some(delay) = self.spec.call_delay {
                    tokio::time::sleep(delay).await;
                }
                let params = params.unwrap_or(Value::Null);
                self.calls
                    .lock()
                    .push((method.to_string(), params.clone()));
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                Ok(json!({
                    "content": [{ "type": "text", "text": format!("{}:{name}", self.name) }],
                    "isError": false,
                }))
            }
            other => Err(SessionError::Backend {
                code: wire::CODE_METHOD_NOT_FOUND,
                message: format!("unknown method {other}"),
                data: None,
            }),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct FakeConnector {
    specs: Mutex<HashMap<String, FakeSpec>>,
    pub connect_counts: Mutex<HashMap<String, u64>>,
    pub sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new(specs: impl IntoIterator<Item = (String, FakeSpec)>) -> Arc<Self> {
        Arc::new(Self {
            specs: Mutex::new(specs.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn connect_count(&self, name: &str) -> u64 {
        *self.connect_counts.lock().get(name).unwrap_or(&0)
    }

    pub fn session(&self, name: &str) -> Option<Arc<FakeSession>> {
        self.sessions.lock().get(name).cloned()
    }

    pub fn calls_to(&self, name: &str) -> Vec<(String, Value)> {
        self.session(name)
            .map(|s| s.calls.lock().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        descriptor: &BackendConfig,
        _limits: &SessionLimits,
        _shutdown: CancellationToken,
    ) -> Result<Arc<dyn BackendSession>, SessionError> {
        // Real connects suspend; keep that shape so coalescing tests see
        // overlapping cycles.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let spec = self
            .specs
            .lock()
            .get(&descriptor.name)
            .cloned()
            .unwrap_or_default();
        let session = Arc::new(FakeSession {
            name: descriptor.name.clone(),
            spec,
            calls: Mutex::new(Vec::new()),
        });

        *self
            .connect_counts
            .lock()
            .entry(descriptor.name.clone())
            .or_insert(0) += 1;
        self.sessions
            .lock()
            .insert(descriptor.name.clone(), session.clone());
        Ok(session)
    }
}

pub fn stdio_backend(name: &str) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        transport: TransportConfig::Stdio(StdioConnect {
            command: format!("{name}-server"),
            args: vec![],
            env: BTreeMap::new(),
        }),
        auth: None,
        group: "default".to_string(),
        filters: FilterRules::default(),
        tool_overrides: BTreeMap::new(),
        timeouts: Default::default(),
    }
}

pub fn base_config(backends: Vec<BackendConfig>, strategy: ConflictStrategy) -> BridgeConfig {
    BridgeConfig {
        backends,
        conflict_resolution: ConflictResolutionConfig {
            strategy,
            separator: "_".to_string(),
            order: vec![],
        },
        audit: AuditConfig {
            enabled: true,
            file: None,
            ..AuditConfig::default()
        },
        ..BridgeConfig::default()
    }
}
