use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::warn;

use crate::models::{Aggregate, SensorReading};

/// Folds one tick's readings into an [`Aggregate`], substituting the mean
/// of the healthy channels for every faulted one.
///
/// When every channel faults in the same tick, the aggregate is filled
/// from the last successfully computed healthy mean instead of failing —
/// the system degrades, it never halts. The aggregator carries that mean
/// across ticks for exactly this case.
pub struct FaultTolerantAggregator {
    last_healthy_mean: Option<f64>,
}

impl FaultTolerantAggregator {
    pub fn new() -> Self {
        Self {
            last_healthy_mean: None,
        }
    }

    pub fn aggregate(&mut self, readings: &[SensorReading], captured_at: DateTime<Utc>) -> Aggregate {
        let healthy: Vec<f64> = readings
            .iter()
            .filter(|r| r.valid)
            .map(|r| r.value)
            .collect();

        let substitute = if healthy.is_empty() {
            let fallback = self.last_healthy_mean.unwrap_or_else(|| {
                // No healthy tick yet: fall back to the carried values the
                // sampler left in the readings themselves.
                mean(readings.iter().map(|r| r.value))
            });
            warn!("all {} channels faulted this tick, carrying mean {fallback:.2}", readings.len());
            fallback
        } else {
            let healthy_mean = mean(healthy.iter().copied());
            self.last_healthy_mean = Some(healthy_mean);
            healthy_mean
        };

        let mut values = BTreeMap::new();
        let mut faulted_channels = BTreeSet::new();

        for reading in readings {
            if reading.valid {
                values.insert(reading.channel.clone(), reading.value);
            } else {
                values.insert(reading.channel.clone(), substitute);
                faulted_channels.insert(reading.channel.clone());
            }
        }

        Aggregate {
            captured_at,
            values,
            faulted_channels,
            classification: None,
        }
    }
}

impl Default for FaultTolerantAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.iter().sum::<f64>() / collected.len() as f64
}
