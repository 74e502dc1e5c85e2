//! Observable backend state: phases, conditions, and status records.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPhase {
    Pending,
    Initializing,
    Ready,
    Degraded,
    Failed,
    ShuttingDown,
}

impl BackendPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::ShuttingDown => "shutting-down",
        }
    }

    /// Whether routes for this backend may appear in the published map.
    pub fn routable(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

impl std::fmt::Display for BackendPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status entry explaining a phase or health event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub ctype: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityCounts {
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

impl CapabilityCounts {
    pub fn total(self) -> usize {
        self.tools + self.resources + self.prompts
    }
}

/// Mutable, observable snapshot of one backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatusRecord {
    pub name: String,
    pub group: String,
    pub transport: &'static str,
    pub phase: BackendPhase,
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    pub capabilities: CapabilityCounts,
}

impl BackendStatusRecord {
    pub fn new(name: &str, group: &str, transport: &'static str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            transport,
            phase: BackendPhase::Pending,
            conditions: Vec::new(),
            last_latency_ms: None,
            capabilities: CapabilityCounts::default(),
        }
    }

    /// Record a condition. The latest entry of the same type is updated in
    /// place so repeated probes cannot grow the list without bound; entries
    /// of other types are untouched.
    pub fn set_condition(&mut self, ctype: &str, status: bool, reason: &str, message: &str) {
        let now = Utc::now();
        if let Some(existing) = self.conditions.iter_mut().rev().find(|c| c.ctype == ctype) {
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.timestamp = now;
            return;
        }
        self.conditions.push(Condition {
            ctype: ctype.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: now,
        });
    }
}

/// Condition types used by the manager and health monitor.
pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_HEALTHY: &str = "Healthy";
