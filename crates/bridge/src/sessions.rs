//! Upstream (client-facing) session tracking.
//!
//! A session is created on the first authenticated MCP interaction, touched
//! on each request, and evicted by a TTL sweep. Each session freezes a
//! route-map snapshot at creation; list replies on that session use the
//! frozen view so the client sees a stable catalog, while live routing
//! always follows the current map.

use crate::registry::RouteMaps;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamTransport {
    Sse,
    StreamableHttp,
}

pub struct UpstreamSession {
    pub id: String,
    pub transport: UpstreamTransport,
    pub created_at: DateTime<Utc>,
    pub subject: String,
    snapshot: Arc<RouteMaps>,
    last_activity: RwLock<Instant>,
}

impl UpstreamSession {
    /// Frozen route-map view taken at session start.
    pub fn snapshot(&self) -> Arc<RouteMaps> {
        self.snapshot.clone()
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

pub struct SessionTracker {
    sessions: RwLock<HashMap<String, Arc<UpstreamSession>>>,
    ttl: Duration,
}

impl SessionTracker {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// Background TTL sweep; runs until the token is cancelled.
    pub fn spawn_sweep(self: &Arc<Self>, shutdown: CancellationToken) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let evicted = tracker.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, "expired upstream sessions evicted");
                        }
                    }
                }
            }
        });
    }

    /// Register a session, freezing the supplied snapshot.
    pub fn create(
        &self,
        id: &str,
        transport: UpstreamTransport,
        subject: &str,
        snapshot: Arc<RouteMaps>,
    ) -> Arc<UpstreamSession> {
        let session = Arc::new(UpstreamSession {
            id: id.to_string(),
            transport,
            created_at: Utc::now(),
            subject: subject.to_string(),
            snapshot,
            last_activity: RwLock::new(Instant::now()),
        });
        self.sessions
            .write()
            .insert(id.to_string(), session.clone());
        session
    }

    /// Look a session up and refresh its activity clock.
    pub fn touch(&self, id: &str) -> Option<Arc<UpstreamSession>> {
        let session = self.sessions.read().get(id).cloned()?;
        if session.idle() > self.ttl {
            self.sessions.write().remove(id);
            return None;
        }
        session.touch();
        Some(session)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Evict every session idle past the TTL; returns the eviction count.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.idle() <= self.ttl);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Arc<RouteMaps> {
        Arc::new(RouteMaps::default())
    }

    #[tokio::test]
    async fn create_touch_and_len() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        tracker.create("s1", UpstreamTransport::StreamableHttp, "alice", snapshot());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.touch("s1").is_some());
        assert!(tracker.touch("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions() {
        let tracker = SessionTracker::new(Duration::from_secs(30));
        tracker.create("s1", UpstreamTransport::Sse, "alice", snapshot());
        tracker.create("s2", UpstreamTransport::Sse, "bob", snapshot());

        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.touch("s2");
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(tracker.sweep(), 1);
        assert!(tracker.touch("s1").is_none());
        assert!(tracker.touch("s2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_rejects_expired_sessions() {
        let tracker = SessionTracker::new(Duration::from_secs(10));
        tracker.create("s1", UpstreamTransport::Sse, "alice", snapshot());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tracker.touch("s1").is_none());
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn snapshot_is_frozen_per_session() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let snap = snapshot();
        let s = tracker.create("s1", UpstreamTransport::StreamableHttp, "alice", snap.clone());
        assert!(Arc::ptr_eq(&s.snapshot(), &snap));
    }
}
