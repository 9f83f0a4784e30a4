use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Aggregate, ChannelId, OccupancySnapshot};

/// Synchronization lifecycle of a persisted record.
///
/// Created `PendingLocalOnly`, then the local write is attempted first
/// (durability floor), then the remote write: `Synced` on success,
/// `SyncFailed` otherwise. `SyncFailed` records are replayed oldest-first
/// on every remote health-recovered event until synced or the retry budget
/// runs out — exhausted records stay in local storage as a standing warning,
/// never discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    PendingLocalOnly,
    Synced,
    SyncFailed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::PendingLocalOnly => "PendingLocalOnly",
            SyncState::Synced => "Synced",
            SyncState::SyncFailed => "SyncFailed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PendingLocalOnly" => Some(SyncState::PendingLocalOnly),
            "Synced" => Some(SyncState::Synced),
            "SyncFailed" => Some(SyncState::SyncFailed),
            _ => None,
        }
    }
}

/// What actually lands in both stores: per-channel values rounded to two
/// decimal places, the faulted-channel markers, and the actuator/occupancy
/// snapshot at persist time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPayload {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<ChannelId, f64>,
    pub faulted_channels: BTreeSet<ChannelId>,
    pub fan_active: bool,
    pub freshener_active: bool,
    pub occupancy: OccupancySnapshot,
}

impl RecordPayload {
    /// Build the persisted shape from an averaged aggregate plus the state
    /// snapshots taken at the persistence tick.
    pub fn from_aggregate(
        aggregate: &Aggregate,
        fan_active: bool,
        freshener_active: bool,
        occupancy: OccupancySnapshot,
    ) -> Self {
        let values = aggregate
            .values
            .iter()
            .map(|(channel, value)| (channel.clone(), round2(*value)))
            .collect();

        Self {
            timestamp: aggregate.captured_at,
            values,
            faulted_channels: aggregate.faulted_channels.clone(),
            fan_active,
            freshener_active,
            occupancy,
        }
    }
}

/// Two-decimal-place rounding applied to persisted values only.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Local view of one logically persisted record. `seq` is the local key
/// (together with the timestamp); `remote_id` is back-filled once the
/// remote store acknowledges the write, so both stores reference the same
/// logical record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub seq: i64,
    pub remote_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: RecordPayload,
    pub sync_state: SyncState,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_truncates_to_cents() {
        assert_eq!(round2(216.666_666), 216.67);
        assert_eq!(round2(200.0), 200.0);
        assert_eq!(round2(0.005), 0.01);
    }

    #[test]
    fn sync_state_round_trips_through_str() {
        for state in [
            SyncState::PendingLocalOnly,
            SyncState::Synced,
            SyncState::SyncFailed,
        ] {
            assert_eq!(SyncState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(SyncState::from_str("bogus"), None);
    }
}
