mod aggregate;
mod reading;
mod record;
mod status;

pub use aggregate::{Aggregate, Trend};
pub use reading::{ChannelId, SensorReading};
pub use record::{PersistedRecord, RecordPayload, SyncState};
pub use status::{ActuatorSnapshot, CoreSnapshot, LinkHealth, OccupancySnapshot};
