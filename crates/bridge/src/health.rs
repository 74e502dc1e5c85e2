//! Periodic backend health probing.
//!
//! For each routable backend the monitor fires `ping` on a fixed interval
//! and keeps rolling failure/slow counters. Failures degrade and then fail a
//! backend; a probe that succeeds but exceeds the latency threshold counts
//! as slow, and three consecutive slow probes degrade the backend without
//! failing it.

use crate::config::{DEFAULT_SLOW_THRESHOLD, HealthConfig};
use crate::manager::{ClientManager, reason};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy)]
struct ProbeState {
    consecutive_failures: u32,
    consecutive_slow: u32,
}

pub struct HealthMonitor {
    manager: Arc<ClientManager>,
    interval: Duration,
    latency_threshold: Duration,
    degraded_threshold: u32,
    failed_threshold: u32,
    states: Mutex<HashMap<String, ProbeState>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<ClientManager>, config: &HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            latency_threshold: Duration::from_secs(config.latency_threshold_secs.max(1)),
            degraded_threshold: config.degraded_threshold.max(1),
            failed_threshold: config.failed_threshold.max(1),
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Background probe loop; runs until the token is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = tick.tick() => monitor.probe_round().await,
                }
            }
        });
    }

    async fn probe_round(self: &Arc<Self>) {
        let names = self.manager.backend_names();
        let probes: Vec<_> = names
            .into_iter()
            .filter(|n| {
                self.manager
                    .phase(n)
                    .is_some_and(crate::status::BackendPhase::routable)
            })
            .map(|name| {
                let monitor = self.clone();
                tokio::spawn(async move { monitor.probe_one(&name).await })
            })
            .collect();
        for p in probes {
            let _ = p.await;
        }
    }

    /// Probe a single backend and apply the transition rules. Also used by
    /// the routing terminal when a route points at an unroutable backend.
    pub async fn probe_one(&self, name: &str) {
        let Some(session) = self.manager.session(name) else {
            return;
        };

        let started = Instant::now();
        let deadline = started + self.latency_threshold.max(Duration::from_secs(1)) * 2;
        let result = session.ping(deadline).await;
        let latency = started.elapsed();

        match result {
            Ok(()) => {
                self.manager.record_latency(name, latency);
                let slow = latency > self.latency_threshold;
                let mut states = self.states.lock();
                let state = states.entry(name.to_string()).or_default();
                state.consecutive_failures = 0;
                if slow {
                    state.consecutive_slow = state.consecutive_slow.saturating_add(1);
                    let slow_count = state.consecutive_slow;
                    drop(states);
                    if slow_count >= DEFAULT_SLOW_THRESHOLD {
                        self.manager.set_health(
                            name,
                            false,
                            reason::HEALTH_DEGRADED,
                            &format!("probe latency {}ms over threshold", latency.as_millis()),
                        );
                    }
                } else {
                    state.consecutive_slow = 0;
                    drop(states);
                    self.manager
                        .set_health(name, true, reason::HEALTH_RECOVERED, "probe ok");
                }
            }
            Err(e) => {
                let failures = {
                    let mut states = self.states.lock();
                    let state = states.entry(name.to_string()).or_default();
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    state.consecutive_slow = 0;
                    state.consecutive_failures
                };
                tracing::warn!(backend = %name, error = %e, failures, "health probe failed");

                if failures >= self.failed_threshold {
                    self.states.lock().remove(name);
                    self.manager
                        .fail_backend(name, reason::HEALTH_FAILED, &e.to_string())
                        .await;
                } else if failures >= self.degraded_threshold {
                    self.manager
                        .set_health(name, false, reason::HEALTH_DEGRADED, &e.to_string());
                }
            }
        }
    }

    /// Forget counters for a backend that was removed or reconnected.
    pub fn reset(&self, name: &str) {
        self.states.lock().remove(name);
    }
}
