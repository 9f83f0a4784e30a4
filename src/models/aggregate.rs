use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChannelId;

/// Air-quality trend over the recent aggregate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trend {
    Stable,
    Rising,
    Falling,
}

/// One tick's fault-substituted multi-channel reading set.
///
/// Every configured channel is present in `values`, even channels that
/// faulted this tick — those carry the substituted value and appear in
/// `faulted_channels`. Immutable once produced; downstream consumers get
/// clones or shared references, never mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub captured_at: DateTime<Utc>,
    pub values: BTreeMap<ChannelId, f64>,
    pub faulted_channels: BTreeSet<ChannelId>,
    pub classification: Option<Trend>,
}

impl Aggregate {
    /// Representative scalar for actuation and trend comparison: the mean
    /// of all channel values at full precision. Rounding only happens when
    /// a record payload is built, so hysteresis never flutters on a
    /// rounding boundary.
    pub fn scalar(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.values().sum::<f64>() / self.values.len() as f64
    }

    pub fn all_faulted(&self) -> bool {
        !self.values.is_empty() && self.faulted_channels.len() == self.values.len()
    }
}
