use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health state of a pool member.
///
/// Only `Healthy` members receive new requests. `Draining` is terminal:
/// the member finishes in-flight work and is then removed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Draining,
}

/// Identity of a worker that survives PID reuse.
///
/// A PID alone is only unique among live processes; pairing it with the
/// start time distinguishes a restarted worker that was handed the same PID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub pid: u32,
    pub started_at_ms: i64,
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.started_at_ms)
    }
}

/// One running application-server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProcess {
    /// OS process identifier.
    pub pid: u32,

    /// `host:port` the worker listens on. Unique within a pool.
    pub addr: String,

    #[serde(default = "default_health")]
    pub health: Health,

    pub started_at: DateTime<Utc>,

    /// Relative share of round-robin selections.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_health() -> Health { Health::Unhealthy }
fn default_weight() -> u32 { 1 }

impl WorkerProcess {
    /// A freshly launched worker. It starts `Unhealthy` and becomes
    /// eligible only after its first successful probe.
    pub fn new(pid: u32, addr: impl Into<String>) -> Self {
        Self::started_at(pid, addr, Utc::now())
    }

    pub fn started_at(pid: u32, addr: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            addr: addr.into(),
            health: Health::Unhealthy,
            started_at,
            weight: 1,
        }
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey {
            pid: self.pid,
            started_at_ms: self.started_at.timestamp_millis(),
        }
    }

    /// Eligible for new selections.
    pub fn is_selectable(&self) -> bool {
        self.health == Health::Healthy
    }

    /// Selection weight, never zero.
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }
}
