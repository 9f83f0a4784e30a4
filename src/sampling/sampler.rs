use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use log::warn;

use crate::{
    errors::TransportError,
    models::{ChannelId, SensorReading},
};

use super::transport::SensorTransport;

/// Polls every configured channel once per tick and applies the validity
/// checks. A failed, timed-out, or out-of-range read produces an invalid
/// reading carrying the channel's last known good value — never zero, so
/// the aggregator's substitution is not dragged toward the bottom of the
/// scale. Each channel gets its own bounded timeout; one hung channel
/// cannot consume the tick.
pub struct Sampler {
    transport: Arc<dyn SensorTransport>,
    channels: Vec<ChannelId>,
    channel_timeout: Duration,
    valid_min: f64,
    valid_max: f64,
    last_known: HashMap<ChannelId, f64>,
}

impl Sampler {
    pub fn new(
        transport: Arc<dyn SensorTransport>,
        channels: Vec<ChannelId>,
        channel_timeout: Duration,
        valid_min: f64,
        valid_max: f64,
    ) -> Self {
        Self {
            transport,
            channels,
            channel_timeout,
            valid_min,
            valid_max,
            last_known: HashMap::new(),
        }
    }

    pub async fn sample_all(&mut self, captured_at: DateTime<Utc>) -> Vec<SensorReading> {
        let mut readings = Vec::with_capacity(self.channels.len());

        for channel in self.channels.clone() {
            let reading = self.sample_channel(&channel, captured_at).await;
            readings.push(reading);
        }

        readings
    }

    async fn sample_channel(
        &mut self,
        channel: &str,
        captured_at: DateTime<Utc>,
    ) -> SensorReading {
        let transport = Arc::clone(&self.transport);
        let channel_name = channel.to_string();

        let read_future = tokio::task::spawn_blocking(move || transport.read(&channel_name));

        let outcome = match tokio::time::timeout(self.channel_timeout, read_future).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TransportError::Read(format!(
                "read worker panicked: {join_err}"
            ))),
            Err(_) => Err(TransportError::Timeout(self.channel_timeout)),
        };

        match outcome {
            Ok(value) if value >= self.valid_min && value <= self.valid_max => {
                self.last_known.insert(channel.to_string(), value);
                SensorReading::valid(channel, value, captured_at)
            }
            Ok(value) => {
                warn!("{channel}: reading {value} outside physical range, marking faulted");
                self.faulted_reading(channel, captured_at)
            }
            Err(err) => {
                warn!("{channel}: read failed ({err}), marking faulted");
                self.faulted_reading(channel, captured_at)
            }
        }
    }

    fn faulted_reading(&self, channel: &str, captured_at: DateTime<Utc>) -> SensorReading {
        let carried = self
            .last_known
            .get(channel)
            .copied()
            .unwrap_or(self.valid_min);
        SensorReading::faulted(channel, carried, captured_at)
    }
}
