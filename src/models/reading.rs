use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical sensor channel name, e.g. "GAS1". Channels are configured, not
/// hard-wired, so the core never knows about pins or bus addresses.
pub type ChannelId = String;

/// One raw sample from one channel. Created once per channel per tick and
/// immutable afterwards; folded into an [`Aggregate`](super::Aggregate) and
/// discarded.
///
/// When a read fails or falls outside the physical range, `valid` is false
/// and `value` carries the channel's last known good value rather than zero,
/// so the substitution step is not biased toward the bottom of the scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub channel: ChannelId,
    pub value: f64,
    pub valid: bool,
    pub captured_at: DateTime<Utc>,
}

impl SensorReading {
    pub fn valid(channel: impl Into<ChannelId>, value: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            channel: channel.into(),
            value,
            valid: true,
            captured_at,
        }
    }

    pub fn faulted(channel: impl Into<ChannelId>, carried: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            channel: channel.into(),
            value: carried,
            valid: false,
            captured_at,
        }
    }
}
