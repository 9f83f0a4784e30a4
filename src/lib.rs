//! Core of a restroom air-quality appliance: samples a bank of gas-sensor
//! channels on a short cadence, aggregates them fault-tolerantly, drives
//! the exhaust fan and air freshener, counts visitors through a debounced
//! proximity sensor, and persists averaged windows local-first with
//! resynchronization to a remote store.
//!
//! [`runtime::CoreController`] is the front door: hand it a
//! [`config::MonitorConfig`] and a set of [`runtime::Backends`] and it owns
//! everything else.

pub mod aggregation;
pub mod config;
pub mod control;
pub mod errors;
pub mod link;
pub mod models;
pub mod persistence;
pub mod runtime;
pub mod sampling;

pub use config::MonitorConfig;
pub use models::{Aggregate, CoreSnapshot, LinkHealth, Trend};
pub use runtime::{Backends, CoreController};
