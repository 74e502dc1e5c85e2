//! Typed audit channel.
//!
//! Audit records are structured values with a fixed schema, written to a
//! rotating newline-delimited JSON sink. This channel is distinct from the
//! operator log: operator log-level configuration cannot suppress it, and
//! free-text logging never goes through it.
//!
//! The sink keeps a bounded in-memory queue between producers and the writer
//! task. On overflow the oldest queued event is dropped and counted; the
//! drop count is surfaced on the management snapshot.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 4096;
const RECENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    McpOperation,
    CapabilityDropped,
    BackendTransition,
    AuthFailure,
    Reload,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditOutcome {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_id: Uuid,
    pub kind: AuditKind,
    pub source: AuditSource,
    pub target: AuditTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AuditOutcome>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: AuditKind) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4(),
            kind,
            source: AuditSource::default(),
            target: AuditTarget::default(),
            outcome: None,
            meta: serde_json::Value::Null,
        }
    }

    pub fn source(mut self, source: AuditSource) -> Self {
        self.source = source;
        self
    }

    pub fn target(mut self, target: AuditTarget) -> Self {
        self.target = target;
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

pub trait AuditSink: Send + Sync {
    /// Enqueue an event. Never blocks; overflow drops the oldest entry.
    fn record(&self, event: AuditEvent);

    /// Events dropped due to backpressure since startup.
    fn dropped(&self) -> u64 {
        0
    }

    /// Most recent retained events, newest last, filtered by time.
    fn recent(&self, since: Option<DateTime<Utc>>, max: usize) -> Vec<AuditEvent> {
        let _ = (since, max);
        Vec::new()
    }
}

#[derive(Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Rotating NDJSON file sink.
pub struct FileAuditSink {
    state: Arc<SinkState>,
}

struct SinkState {
    queue: Mutex<VecDeque<AuditEvent>>,
    recent: Mutex<VecDeque<AuditEvent>>,
    notify: tokio::sync::Notify,
    dropped: AtomicU64,
    path: PathBuf,
    max_size: u64,
    backup_count: u32,
}

impl FileAuditSink {
    pub fn new(
        path: impl Into<PathBuf>,
        max_size: u64,
        backup_count: u32,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let state = Arc::new(SinkState {
            queue: Mutex::new(VecDeque::with_capacity(256)),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            notify: tokio::sync::Notify::new(),
            dropped: AtomicU64::new(0),
            path: path.into(),
            max_size: max_size.max(1),
            backup_count: backup_count.max(1),
        });
        let sink = Arc::new(Self {
            state: state.clone(),
        });
        tokio::spawn(writer_task(state, shutdown));
        sink
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        {
            let mut recent = self.state.recent.lock();
            if recent.len() >= RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        let mut queue = self.state.queue.lock();
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
            self.state.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.state.notify.notify_one();
    }

    fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    fn recent(&self, since: Option<DateTime<Utc>>, max: usize) -> Vec<AuditEvent> {
        let recent = self.state.recent.lock();
        recent
            .iter()
            .filter(|e| since.is_none_or(|s| e.timestamp >= s))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(max)
            .cloned()
            .rev()
            .collect()
    }
}

async fn writer_task(state: Arc<SinkState>, shutdown: CancellationToken) {
    loop {
        let batch: Vec<AuditEvent> = {
            let mut queue = state.queue.lock();
            queue.drain(..).collect()
        };

        if !batch.is_empty()
            && let Err(e) = write_batch(&state, &batch)
        {
            tracing::warn!(error = %e, path = %state.path.display(), "audit sink write failed");
        }

        tokio::select! {
            () = shutdown.cancelled() => {
                // Final drain before exit.
                let rest: Vec<AuditEvent> = state.queue.lock().drain(..).collect();
                if !rest.is_empty()
                    && let Err(e) = write_batch(&state, &rest)
                {
                    tracing::warn!(error = %e, "audit sink final flush failed");
                }
                break;
            }
            () = state.notify.notified() => {}
            () = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }
}

fn write_batch(state: &SinkState, batch: &[AuditEvent]) -> std::io::Result<()> {
    rotate_if_needed(&state.path, state.max_size, state.backup_count)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&state.path)?;
    for event in batch {
        let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.flush()
}

/// Size-based rotation: `audit.log` -> `audit.log.1` -> ... -> `.N` dropped.
fn rotate_if_needed(path: &Path, max_size: u64, backup_count: u32) -> std::io::Result<()> {
    let size = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };
    if size < max_size {
        return Ok(());
    }

    let backup = |n: u32| -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(format!(".{n}"));
        PathBuf::from(p)
    };

    let _ = std::fs::remove_file(backup(backup_count));
    for n in (1..backup_count).rev() {
        let _ = std::fs::rename(backup(n), backup(n + 1));
    }
    std::fs::rename(path, backup(1))
}

/// In-memory sink for tests and for deployments with audit files disabled:
/// keeps the recent ring but writes nothing.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    dropped: AtomicU64,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= RECENT_CAPACITY {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn recent(&self, since: Option<DateTime<Utc>>, max: usize) -> Vec<AuditEvent> {
        let events = self.events.lock();
        events
            .iter()
            .filter(|e| since.is_none_or(|s| e.timestamp >= s))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(max)
            .cloned()
            .rev()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_snake_case_kind() {
        let ev = AuditEvent::new(AuditKind::AuthFailure);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "auth_failure");
        assert!(v.get("outcome").is_none());
    }

    #[test]
    fn memory_sink_retains_and_filters() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::new(AuditKind::McpOperation));
        sink.record(AuditEvent::new(AuditKind::Reload));
        assert_eq!(sink.recent(None, 10).len(), 2);
        assert_eq!(sink.recent(None, 1).len(), 1);
        // max applies from the newest end.
        assert!(matches!(sink.recent(None, 1)[0].kind, AuditKind::Reload));
    }

    #[test]
    fn rotation_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, vec![b'x'; 64]).unwrap();

        rotate_if_needed(&path, 16, 2).unwrap();
        assert!(!path.exists());
        assert!(dir.path().join("audit.log.1").exists());

        std::fs::write(&path, vec![b'y'; 64]).unwrap();
        rotate_if_needed(&path, 16, 2).unwrap();
        assert!(dir.path().join("audit.log.2").exists());
        let first = std::fs::read(dir.path().join("audit.log.2")).unwrap();
        assert_eq!(first[0], b'x');
    }

    #[test]
    fn rotation_is_noop_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, b"small").unwrap();
        rotate_if_needed(&path, 1024, 2).unwrap();
        assert!(path.exists());
    }
}
