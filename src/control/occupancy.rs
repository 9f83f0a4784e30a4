use std::time::Duration;

use chrono::Utc;
use log::info;
use tokio::time::Instant;

use crate::models::OccupancySnapshot;

/// Confirmed occupancy transitions after debouncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyEvent {
    Occupied,
    /// The cubicle just went from occupied to vacant; this is what arms
    /// the freshener pulse.
    Vacated,
}

/// Converts the raw proximity level into a debounced occupied/vacant
/// stream plus a monotonically increasing visitor counter.
///
/// The initial state is unknown-vacant: a proximity sensor's first
/// reported level after power-on is indistinguishable from its power-on
/// default, so the very first raw sample only primes the tracker and is
/// never interpreted as a transition. After priming, a flip is honored
/// only when the level differs from the last honored one and at least the
/// debounce period has passed since the last honored transition.
pub struct OccupancyDebouncer {
    debounce: Duration,
    primed: bool,
    last_raw_state: bool,
    occupied: bool,
    visitor_count: u64,
    last_honored: Option<Instant>,
    snapshot: OccupancySnapshot,
}

impl OccupancyDebouncer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            primed: false,
            // Seeded to the sensor's idle / no-detection level.
            last_raw_state: false,
            occupied: false,
            visitor_count: 0,
            last_honored: None,
            snapshot: OccupancySnapshot::vacant(),
        }
    }

    /// Restore the visitor counter from the newest persisted record so a
    /// restart does not reset the day's count.
    pub fn seed_visitor_count(&mut self, count: u64) {
        self.visitor_count = count;
        self.snapshot.visitor_count = count;
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        self.snapshot.clone()
    }

    pub fn observe(&mut self, raw_detecting: bool, now: Instant) -> Option<OccupancyEvent> {
        if !self.primed {
            self.primed = true;
            self.last_raw_state = raw_detecting;
            // An occupied power-on level still means occupied, it just
            // isn't an arrival: no event, no count.
            self.occupied = raw_detecting;
            self.snapshot.occupied = raw_detecting;
            return None;
        }

        if raw_detecting == self.last_raw_state {
            return None;
        }

        let debounced = self
            .last_honored
            .map(|at| now.duration_since(at) >= self.debounce)
            .unwrap_or(true);
        if !debounced {
            return None;
        }

        self.last_raw_state = raw_detecting;
        self.last_honored = Some(now);
        self.occupied = raw_detecting;

        let event = if raw_detecting {
            self.visitor_count += 1;
            info!("occupied (visitor #{})", self.visitor_count);
            OccupancyEvent::Occupied
        } else {
            info!("vacated");
            OccupancyEvent::Vacated
        };

        self.snapshot = OccupancySnapshot {
            occupied: self.occupied,
            visitor_count: self.visitor_count,
            last_transition_at: Some(Utc::now()),
        };

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(500);

    #[test]
    fn first_sample_never_emits_regardless_of_level() {
        let mut vacant_start = OccupancyDebouncer::new(DEBOUNCE);
        assert_eq!(vacant_start.observe(false, Instant::now()), None);
        assert_eq!(vacant_start.snapshot().visitor_count, 0);

        let mut occupied_start = OccupancyDebouncer::new(DEBOUNCE);
        assert_eq!(occupied_start.observe(true, Instant::now()), None);
        assert_eq!(occupied_start.snapshot().visitor_count, 0);
        assert!(occupied_start.snapshot().occupied);
    }

    #[test]
    fn arrival_increments_visitor_count_once() {
        let mut debouncer = OccupancyDebouncer::new(DEBOUNCE);
        let t0 = Instant::now();

        debouncer.observe(false, t0);
        assert_eq!(
            debouncer.observe(true, t0 + Duration::from_secs(1)),
            Some(OccupancyEvent::Occupied)
        );
        assert_eq!(debouncer.snapshot().visitor_count, 1);

        assert_eq!(
            debouncer.observe(false, t0 + Duration::from_secs(2)),
            Some(OccupancyEvent::Vacated)
        );
        assert_eq!(debouncer.snapshot().visitor_count, 1, "no count on departure");
    }

    #[test]
    fn two_flips_inside_debounce_period_honor_at_most_one() {
        let mut debouncer = OccupancyDebouncer::new(DEBOUNCE);
        let t0 = Instant::now();

        debouncer.observe(false, t0);
        let first = debouncer.observe(true, t0 + Duration::from_secs(1));
        let second = debouncer.observe(false, t0 + Duration::from_secs(1) + Duration::from_millis(100));

        assert_eq!(first, Some(OccupancyEvent::Occupied));
        assert_eq!(second, None, "bounce suppressed");
        assert!(debouncer.snapshot().occupied);
    }

    #[test]
    fn suppressed_flip_is_honored_after_the_period() {
        let mut debouncer = OccupancyDebouncer::new(DEBOUNCE);
        let t0 = Instant::now();

        debouncer.observe(false, t0);
        debouncer.observe(true, t0 + Duration::from_secs(1));
        debouncer.observe(false, t0 + Duration::from_millis(1100)); // bounce, suppressed

        assert_eq!(
            debouncer.observe(false, t0 + Duration::from_secs(2)),
            Some(OccupancyEvent::Vacated)
        );
    }

    #[test]
    fn unchanged_level_emits_nothing() {
        let mut debouncer = OccupancyDebouncer::new(DEBOUNCE);
        let t0 = Instant::now();

        debouncer.observe(false, t0);
        for i in 1..10 {
            assert_eq!(debouncer.observe(false, t0 + Duration::from_secs(i)), None);
        }
    }

    #[test]
    fn seeded_visitor_count_keeps_counting_upward() {
        let mut debouncer = OccupancyDebouncer::new(DEBOUNCE);
        debouncer.seed_visitor_count(41);
        let t0 = Instant::now();

        debouncer.observe(false, t0);
        debouncer.observe(true, t0 + Duration::from_secs(1));
        assert_eq!(debouncer.snapshot().visitor_count, 42);
    }
}
