use std::collections::VecDeque;

use crate::models::{Aggregate, Trend};

/// Rolling-window rate-of-change classifier over aggregate scalars.
///
/// The current scalar is compared against the window mean: more than
/// `threshold` above is Rising, more than `threshold` below is Falling.
/// Until the window has seen `window - 1` samples the answer is Stable by
/// convention — insufficient data is not an error. The window is purely
/// in-memory; on restart it can be re-seeded from the remote store's most
/// recent records via [`preload`](Self::preload).
pub struct TrendTracker {
    window: usize,
    threshold: f64,
    history: VecDeque<f64>,
}

impl TrendTracker {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            window: window.max(1),
            threshold,
            history: VecDeque::with_capacity(window),
        }
    }

    /// Seed the window with historical scalars, oldest first.
    pub fn preload(&mut self, scalars: impl IntoIterator<Item = f64>) {
        for scalar in scalars {
            self.push(scalar);
        }
    }

    pub fn observe(&mut self, aggregate: &Aggregate) -> Trend {
        let scalar = aggregate.scalar();

        let label = if self.history.len() + 1 < self.window {
            Trend::Stable
        } else {
            let window_mean =
                self.history.iter().sum::<f64>() / self.history.len().max(1) as f64;
            if scalar > window_mean + self.threshold {
                Trend::Rising
            } else if scalar < window_mean - self.threshold {
                Trend::Falling
            } else {
                Trend::Stable
            }
        };

        self.push(scalar);
        label
    }

    fn push(&mut self, scalar: f64) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(scalar);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::Utc;

    use super::*;

    fn aggregate_with_scalar(scalar: f64) -> Aggregate {
        let mut values = BTreeMap::new();
        values.insert("GAS1".to_string(), scalar);
        Aggregate {
            captured_at: Utc::now(),
            values,
            faulted_channels: BTreeSet::new(),
            classification: None,
        }
    }

    #[test]
    fn insufficient_data_reports_stable() {
        let mut tracker = TrendTracker::new(4, 10.0);
        assert_eq!(tracker.observe(&aggregate_with_scalar(100.0)), Trend::Stable);
        assert_eq!(tracker.observe(&aggregate_with_scalar(400.0)), Trend::Stable);
    }

    #[test]
    fn rising_when_scalar_clears_window_mean_by_threshold() {
        let mut tracker = TrendTracker::new(3, 10.0);
        tracker.preload([100.0, 100.0]);
        assert_eq!(tracker.observe(&aggregate_with_scalar(140.0)), Trend::Rising);
    }

    #[test]
    fn falling_when_scalar_drops_below_window_mean() {
        let mut tracker = TrendTracker::new(3, 10.0);
        tracker.preload([200.0, 200.0]);
        assert_eq!(tracker.observe(&aggregate_with_scalar(150.0)), Trend::Falling);
    }

    #[test]
    fn within_threshold_is_stable() {
        let mut tracker = TrendTracker::new(3, 10.0);
        tracker.preload([200.0, 200.0]);
        assert_eq!(tracker.observe(&aggregate_with_scalar(205.0)), Trend::Stable);
    }

    #[test]
    fn preload_fills_window_so_first_observation_classifies() {
        let mut tracker = TrendTracker::new(4, 10.0);
        tracker.preload([100.0, 110.0, 105.0]);
        assert_eq!(tracker.observe(&aggregate_with_scalar(160.0)), Trend::Rising);
    }
}
