pub mod sampler;
pub mod transport;

pub use sampler::Sampler;
pub use transport::{OccupancySensor, SensorTransport, SimulatedOccupancy, SimulatedTransport};
