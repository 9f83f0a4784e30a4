use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, watch, Mutex},
    time::{Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregation::{FaultTolerantAggregator, TrendTracker},
    control::{ActuatorController, OccupancyDebouncer, OccupancyEvent},
    models::Aggregate,
    sampling::{OccupancySensor, Sampler},
};

use super::SharedState;

/// The short-period worker: sample, aggregate, classify, actuate. Runs
/// every sample tick and forwards each finished aggregate to the
/// persistence worker over a bounded channel — never the other way
/// around, so a slow persistence path can never delay actuation.
pub(crate) struct SampleWorker {
    pub sampler: Sampler,
    pub aggregator: FaultTolerantAggregator,
    pub trend: TrendTracker,
    pub actuators: ActuatorController,
    pub debouncer: OccupancyDebouncer,
    pub occupancy_sensor: Arc<dyn OccupancySensor>,
    pub aggregate_tx: mpsc::Sender<Aggregate>,
    pub shared: Arc<Mutex<SharedState>>,
    pub pause_rx: watch::Receiver<bool>,
    pub sample_period: Duration,
    pub cancel: CancellationToken,
}

impl SampleWorker {
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.sample_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *self.pause_rx.borrow() {
                        continue;
                    }
                    self.tick().await;
                }
                _ = self.cancel.cancelled() => {
                    info!("sample loop shutting down");
                    break;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let captured_at = Utc::now();
        let now = Instant::now();

        let readings = self.sampler.sample_all(captured_at).await;
        let mut aggregate = self.aggregator.aggregate(&readings, captured_at);
        aggregate.classification = Some(self.trend.observe(&aggregate));

        if aggregate.all_faulted() {
            warn!("aggregate degraded: every channel faulted this tick");
        }

        let vacated = match self.occupancy_sensor.detecting() {
            Ok(raw) => matches!(
                self.debouncer.observe(raw, now),
                Some(OccupancyEvent::Vacated)
            ),
            Err(err) => {
                warn!("occupancy sensor read failed: {err}");
                false
            }
        };

        self.actuators.evaluate(aggregate.scalar(), vacated, now);

        debug!(
            "tick: scalar {:.2}, trend {:?}, {} faulted, fan {}, occupied {}",
            aggregate.scalar(),
            aggregate.classification,
            aggregate.faulted_channels.len(),
            self.actuators.fan_active(),
            self.debouncer.snapshot().occupied,
        );

        {
            let mut shared = self.shared.lock().await;
            shared.latest_aggregate = Some(aggregate.clone());
            shared.fan = self.actuators.fan_snapshot();
            shared.freshener = self.actuators.freshener_snapshot();
            shared.occupancy = self.debouncer.snapshot();
        }

        // Bounded handoff: if the persistence side is drowning, dropping a
        // sample from the averaging window beats blocking actuation.
        if let Err(err) = self.aggregate_tx.try_send(aggregate) {
            warn!("aggregate queue full, dropping sample from persistence window: {err}");
        }
    }
}
