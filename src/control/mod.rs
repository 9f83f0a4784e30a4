pub mod actuators;
pub mod occupancy;

pub use actuators::{ActuatorController, ActuatorOutput};
pub use occupancy::{OccupancyDebouncer, OccupancyEvent};
