use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use log::{error, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::ActuatorSnapshot;

/// Binary on/off output with no read-back (relay behind a GPIO expander).
/// Writes are fire-and-forget: a failed write is logged and the state
/// machine re-asserts the level on its next transition.
pub trait ActuatorOutput: Send + Sync {
    fn set_active(&self, active: bool) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanState {
    Off,
    On,
}

/// Drives the exhaust fan and the air-freshener from the aggregate scalar
/// and the occupancy vacate event.
///
/// The fan runs a two-threshold hysteresis loop: strictly above
/// `fan_on` latches On, at or below `fan_off` releases. The freshener is a
/// pulse, not a level: the OFF write is scheduled on its own timer so the
/// dispenser is energized for exactly `pulse` regardless of the caller's
/// evaluation cadence, and it re-arms only once the scalar has dropped
/// back below the trigger AND `cooldown` has elapsed, so a lingering bad
/// reading cannot machine-gun the dispenser.
pub struct ActuatorController {
    fan_output: Arc<dyn ActuatorOutput>,
    freshener_output: Arc<dyn ActuatorOutput>,

    fan_on: f64,
    fan_off: f64,
    fan_state: FanState,
    fan_snapshot: ActuatorSnapshot,

    freshener_threshold: f64,
    pulse: Duration,
    cooldown: Duration,
    freshener_armed: bool,
    last_pulse_at: Option<Instant>,
    // Shared with the in-flight pulse task, which flips them back when the
    // pulse width elapses.
    freshener_active: Arc<AtomicBool>,
    freshener_snapshot: Arc<Mutex<ActuatorSnapshot>>,
    pulse_cancel: CancellationToken,
}

impl ActuatorController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fan_output: Arc<dyn ActuatorOutput>,
        freshener_output: Arc<dyn ActuatorOutput>,
        fan_on: f64,
        fan_off: f64,
        freshener_threshold: f64,
        pulse: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            fan_output,
            freshener_output,
            fan_on,
            fan_off,
            fan_state: FanState::Off,
            fan_snapshot: ActuatorSnapshot::inactive(),
            freshener_threshold,
            pulse,
            cooldown,
            freshener_armed: true,
            last_pulse_at: None,
            freshener_active: Arc::new(AtomicBool::new(false)),
            freshener_snapshot: Arc::new(Mutex::new(ActuatorSnapshot::inactive())),
            pulse_cancel: CancellationToken::new(),
        }
    }

    /// One evaluation pass, called every sample tick with the fresh
    /// aggregate scalar and whether the cubicle was just vacated.
    pub fn evaluate(&mut self, scalar: f64, vacated: bool, now: Instant) {
        self.evaluate_fan(scalar);
        self.evaluate_freshener(scalar, vacated, now);
    }

    pub fn fan_active(&self) -> bool {
        self.fan_state == FanState::On
    }

    pub fn freshener_active(&self) -> bool {
        self.freshener_active.load(Ordering::Acquire)
    }

    pub fn fan_snapshot(&self) -> ActuatorSnapshot {
        self.fan_snapshot.clone()
    }

    pub fn freshener_snapshot(&self) -> ActuatorSnapshot {
        lock_snapshot(&self.freshener_snapshot).clone()
    }

    fn evaluate_fan(&mut self, scalar: f64) {
        match self.fan_state {
            FanState::Off if scalar > self.fan_on => {
                self.fan_state = FanState::On;
                self.fan_snapshot = ActuatorSnapshot {
                    is_active: true,
                    last_changed_at: Some(Utc::now()),
                };
                info!("fan ON (scalar {scalar:.2} > {})", self.fan_on);
                write_output(self.fan_output.as_ref(), "fan", true);
            }
            FanState::On if scalar <= self.fan_off => {
                self.fan_state = FanState::Off;
                self.fan_snapshot = ActuatorSnapshot {
                    is_active: false,
                    last_changed_at: Some(Utc::now()),
                };
                info!("fan OFF (scalar {scalar:.2} <= {})", self.fan_off);
                write_output(self.fan_output.as_ref(), "fan", false);
            }
            _ => {}
        }
    }

    fn evaluate_freshener(&mut self, scalar: f64, vacated: bool, now: Instant) {
        // The pulse task owns the OFF transition; nothing to decide while
        // a pulse is in flight.
        if self.freshener_active.load(Ordering::Acquire) {
            return;
        }

        // Re-arm once the scalar has fallen back under the trigger level.
        if !self.freshener_armed && scalar < self.freshener_threshold {
            self.freshener_armed = true;
        }

        let cooldown_over = self
            .last_pulse_at
            .map(|at| now.duration_since(at) >= self.cooldown)
            .unwrap_or(true);

        let triggered = scalar > self.freshener_threshold || vacated;

        if triggered && self.freshener_armed && cooldown_over {
            self.freshener_armed = false;
            self.last_pulse_at = Some(now);
            self.freshener_active.store(true, Ordering::Release);
            *lock_snapshot(&self.freshener_snapshot) = ActuatorSnapshot {
                is_active: true,
                last_changed_at: Some(Utc::now()),
            };
            if vacated {
                info!("freshener pulse (cubicle vacated)");
            } else {
                info!("freshener pulse (scalar {scalar:.2} > {})", self.freshener_threshold);
            }
            write_output(self.freshener_output.as_ref(), "freshener", true);
            self.spawn_pulse_off();
        }
    }

    /// Schedules the OFF write on its own timer so the dispenser is held
    /// for exactly the pulse width, independent of how often `evaluate`
    /// runs. Dropping the controller cancels the wait and the level is
    /// written back to off immediately.
    fn spawn_pulse_off(&self) {
        let output = Arc::clone(&self.freshener_output);
        let active = Arc::clone(&self.freshener_active);
        let snapshot = Arc::clone(&self.freshener_snapshot);
        let cancel = self.pulse_cancel.clone();
        let pulse = self.pulse;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(pulse) => {}
                _ = cancel.cancelled() => {}
            }
            active.store(false, Ordering::Release);
            *lock_snapshot(&snapshot) = ActuatorSnapshot {
                is_active: false,
                last_changed_at: Some(Utc::now()),
            };
            write_output(output.as_ref(), "freshener", false);
        });
    }
}

impl Drop for ActuatorController {
    fn drop(&mut self) {
        self.pulse_cancel.cancel();
    }
}

fn write_output(output: &dyn ActuatorOutput, name: &str, active: bool) {
    if let Err(err) = output.set_active(active) {
        // No read-back exists, so there is nothing to reconcile; the next
        // transition writes the level again.
        error!("{name} output write failed: {err:#}");
    }
}

fn lock_snapshot(snapshot: &Mutex<ActuatorSnapshot>) -> std::sync::MutexGuard<'_, ActuatorSnapshot> {
    match snapshot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
