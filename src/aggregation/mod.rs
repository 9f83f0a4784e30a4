pub mod aggregator;
pub mod trend;

pub use aggregator::FaultTolerantAggregator;
pub use trend::TrendTracker;
