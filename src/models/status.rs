use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Aggregate;

/// Status of one external dependency, surfaced to the presentation layer.
/// Sensor-link, remote-store and local-store health are tracked
/// independently so one failing backend never masks another. `Degraded` is
/// recoverable and keeps being retried; `Fatal` is latched when the local
/// durability floor fails and needs operator attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "reason")]
pub enum LinkHealth {
    Healthy,
    Degraded(String),
    Fatal(String),
}

impl LinkHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, LinkHealth::Healthy)
    }
}

/// Debounced occupancy state. `visitor_count` increments exactly once per
/// confirmed vacant-to-occupied transition and never decrements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancySnapshot {
    pub occupied: bool,
    pub visitor_count: u64,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl OccupancySnapshot {
    pub fn vacant() -> Self {
        Self {
            occupied: false,
            visitor_count: 0,
            last_transition_at: None,
        }
    }
}

/// On/off state of one physical output, as the controller believes it to
/// be. Outputs are write-only, so there is no read-back confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorSnapshot {
    pub is_active: bool,
    pub last_changed_at: Option<DateTime<Utc>>,
}

impl ActuatorSnapshot {
    pub fn inactive() -> Self {
        Self {
            is_active: false,
            last_changed_at: None,
        }
    }
}

/// Read-only view of the whole core for the presentation layer. The core
/// owns all of this state; the snapshot is a point-in-time clone.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreSnapshot {
    pub latest_aggregate: Option<Aggregate>,
    pub fan: ActuatorSnapshot,
    pub freshener: ActuatorSnapshot,
    pub occupancy: OccupancySnapshot,
    pub sensor_link: LinkHealth,
    pub remote_link: LinkHealth,
    /// `Fatal` once a write to the local durable store has failed; local
    /// failures are never retried automatically, so this does not clear
    /// on its own.
    pub local_store: LinkHealth,
    pub pending_retries: usize,
    pub exhausted_retries: usize,
}
