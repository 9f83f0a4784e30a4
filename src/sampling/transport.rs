use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;

use crate::errors::TransportError;

/// Blocking handle onto whatever carries the raw channel values (serial
/// line to the gas-sensor board, I2C bus, ...). The concrete transport
/// lives outside the core; reads are dispatched through `spawn_blocking`
/// so a stalled bus never blocks the scheduler.
pub trait SensorTransport: Send + Sync {
    fn read(&self, channel: &str) -> Result<f64, TransportError>;

    /// Cheap health probe used by the link supervisor.
    fn is_connected(&self) -> bool;
}

/// Raw binary proximity level feeding the occupancy debouncer. `true`
/// means the sensor currently detects presence.
pub trait OccupancySensor: Send + Sync {
    fn detecting(&self) -> Result<bool, TransportError>;
}

/// Stand-in transport producing plausible readings when no hardware is
/// attached, mirroring the appliance's simulated-data fallback. Values are
/// drawn uniformly from a band so the aggregation and actuation paths stay
/// exercised on a bench.
pub struct SimulatedTransport {
    min: f64,
    max: f64,
    connected: AtomicBool,
}

impl SimulatedTransport {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl SensorTransport for SimulatedTransport {
    fn read(&self, _channel: &str) -> Result<f64, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(rand::thread_rng().gen_range(self.min..self.max))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Simulated proximity sensor that idles at "no detection".
pub struct SimulatedOccupancy {
    detecting: AtomicBool,
}

impl SimulatedOccupancy {
    pub fn new() -> Self {
        Self {
            detecting: AtomicBool::new(false),
        }
    }

    pub fn set_detecting(&self, detecting: bool) {
        self.detecting.store(detecting, Ordering::Release);
    }
}

impl Default for SimulatedOccupancy {
    fn default() -> Self {
        Self::new()
    }
}

impl OccupancySensor for SimulatedOccupancy {
    fn detecting(&self) -> Result<bool, TransportError> {
        Ok(self.detecting.load(Ordering::Acquire))
    }
}
