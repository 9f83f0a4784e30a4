mod persist_loop;
mod sample_loop;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregation::{FaultTolerantAggregator, TrendTracker},
    config::MonitorConfig,
    control::{ActuatorController, ActuatorOutput, OccupancyDebouncer},
    link::{LinkProbe, LinkSupervisor, RetryPolicy},
    models::{
        ActuatorSnapshot, Aggregate, CoreSnapshot, LinkHealth, OccupancySnapshot, RecordPayload,
    },
    persistence::{PersistenceGateway, RemoteStore, SqliteStore},
    sampling::{OccupancySensor, Sampler, SensorTransport},
};

use persist_loop::PersistWorker;
use sample_loop::SampleWorker;

/// Depth of the sample-to-persistence handoff channel. Sized for several
/// persistence windows of backlog before samples start getting dropped.
const AGGREGATE_CHANNEL_DEPTH: usize = 64;

/// State shared between the two workers and `CoreSnapshot` readers. The
/// sample loop is the only writer.
pub(crate) struct SharedState {
    pub latest_aggregate: Option<Aggregate>,
    pub fan: ActuatorSnapshot,
    pub freshener: ActuatorSnapshot,
    pub occupancy: OccupancySnapshot,
    /// Latched to `Fatal` by the persistence worker when the local
    /// durability floor fails.
    pub local_store: LinkHealth,
}

impl SharedState {
    fn new() -> Self {
        Self {
            latest_aggregate: None,
            fan: ActuatorSnapshot::inactive(),
            freshener: ActuatorSnapshot::inactive(),
            occupancy: OccupancySnapshot::vacant(),
            local_store: LinkHealth::Healthy,
        }
    }
}

/// The hardware and remote-store backends the core runs against. Concrete
/// implementations live with the embedder; the simulated ones in
/// [`crate::sampling`] cover bench runs.
pub struct Backends {
    pub transport: Arc<dyn SensorTransport>,
    pub occupancy: Arc<dyn OccupancySensor>,
    pub fan: Arc<dyn ActuatorOutput>,
    pub freshener: Arc<dyn ActuatorOutput>,
    pub remote: Option<Arc<dyn RemoteStore>>,
}

/// Owns the running core: the two worker loops, the link supervisors and
/// the persistence gateway. Constructed via [`CoreController::start`] and
/// torn down via [`CoreController::stop`], which drains and flushes before
/// returning.
pub struct CoreController {
    shared: Arc<Mutex<SharedState>>,
    gateway: Arc<PersistenceGateway>,

    sensor_health: watch::Receiver<LinkHealth>,
    remote_health: watch::Receiver<LinkHealth>,
    // Keeps the remote-health channel open when no supervisor task exists
    // (local-only mode).
    _remote_health_tx: Option<watch::Sender<LinkHealth>>,

    pause_tx: watch::Sender<bool>,
    // Held so the aggregate channel only closes once the controller is
    // dropped, after the persistence worker has flushed.
    _aggregate_tx: mpsc::Sender<Aggregate>,

    worker_cancel: CancellationToken,
    link_cancel: CancellationToken,
    sample_handle: JoinHandle<()>,
    persist_handle: JoinHandle<()>,
    link_handles: Vec<JoinHandle<()>>,
}

impl CoreController {
    /// Brings the whole core up: opens the local store, restores the
    /// visitor count and trend history from persisted data, starts the
    /// link supervisors, then spawns the sample and persistence loops.
    pub async fn start(config: MonitorConfig, backends: Backends) -> Result<Self> {
        config.validate()?;

        let local = SqliteStore::new(config.local_db_path.clone())
            .context("failed to open local store")?;

        // The visitor count survives restarts: re-seed it from the last
        // persisted record rather than starting over at zero.
        let mut debouncer = OccupancyDebouncer::new(config.debounce_period());
        match local.latest_payload().await {
            Ok(Some(payload)) => {
                info!(
                    "restored visitor count {} from last persisted record",
                    payload.occupancy.visitor_count
                );
                debouncer.seed_visitor_count(payload.occupancy.visitor_count);
            }
            Ok(None) => {}
            Err(err) => warn!("could not restore visitor count: {err}"),
        }

        let backoff = RetryPolicy::new(config.backoff_initial(), config.backoff_max());
        let gateway = Arc::new(
            PersistenceGateway::new(
                local,
                backends.remote.clone(),
                config.retry_budget,
                config.consecutive_failure_backoff,
                backoff,
            )
            .await
            .context("failed to initialize persistence gateway")?,
        );

        let mut trend = TrendTracker::new(config.trend_window, config.trend_threshold);
        if gateway.has_remote() {
            match gateway.remote_recent(config.trend_window).await {
                Ok(records) => trend.preload(records.iter().map(payload_scalar)),
                Err(err) => warn!("trend preload from remote store skipped: {err}"),
            }
        }

        let link_cancel = CancellationToken::new();
        let mut link_handles = Vec::new();

        let sensor_probe: LinkProbe = {
            let transport = Arc::clone(&backends.transport);
            Arc::new(move || transport.is_connected())
        };
        let (sensor_handle, sensor_health) = LinkSupervisor::spawn(
            "sensor",
            sensor_probe,
            backoff,
            config.sample_period(),
            link_cancel.clone(),
        );
        link_handles.push(sensor_handle);

        let (remote_health, remote_health_tx) = match &backends.remote {
            Some(remote) => {
                let remote_probe: LinkProbe = {
                    let remote = Arc::clone(remote);
                    Arc::new(move || remote.ping().is_ok())
                };
                let (remote_handle, remote_health) = LinkSupervisor::spawn(
                    "remote store",
                    remote_probe,
                    backoff,
                    config.persist_period(),
                    link_cancel.clone(),
                );
                link_handles.push(remote_handle);
                (remote_health, None)
            }
            None => {
                info!("remote store not configured, running local-only");
                let (tx, rx) = watch::channel(LinkHealth::Degraded(
                    "remote store not configured".to_string(),
                ));
                (rx, Some(tx))
            }
        };

        let sampler = Sampler::new(
            Arc::clone(&backends.transport),
            config.channels.clone(),
            config.channel_timeout(),
            config.valid_min,
            config.valid_max,
        );
        let actuators = ActuatorController::new(
            Arc::clone(&backends.fan),
            Arc::clone(&backends.freshener),
            config.fan_on_threshold,
            config.fan_off_threshold,
            config.freshener_threshold,
            config.freshener_pulse(),
            config.freshener_cooldown(),
        );

        let shared = Arc::new(Mutex::new(SharedState::new()));
        let (aggregate_tx, aggregate_rx) = mpsc::channel(AGGREGATE_CHANNEL_DEPTH);
        let (pause_tx, pause_rx) = watch::channel(false);
        let worker_cancel = CancellationToken::new();

        let sample_worker = SampleWorker {
            sampler,
            aggregator: FaultTolerantAggregator::new(),
            trend,
            actuators,
            debouncer,
            occupancy_sensor: Arc::clone(&backends.occupancy),
            aggregate_tx: aggregate_tx.clone(),
            shared: Arc::clone(&shared),
            pause_rx,
            sample_period: config.sample_period(),
            cancel: worker_cancel.clone(),
        };
        let persist_worker = PersistWorker {
            gateway: Arc::clone(&gateway),
            aggregate_rx,
            remote_health: remote_health.clone(),
            shared: Arc::clone(&shared),
            persist_period: config.persist_period(),
            flush_timeout: config.shutdown_flush(),
            cancel: worker_cancel.clone(),
        };

        let sample_handle = tokio::spawn(sample_worker.run());
        let persist_handle = tokio::spawn(persist_worker.run());
        info!(
            "core started: {} channels, {:?} sample period, {:?} persistence period",
            config.channels.len(),
            config.sample_period(),
            config.persist_period()
        );

        Ok(Self {
            shared,
            gateway,
            sensor_health,
            remote_health,
            _remote_health_tx: remote_health_tx,
            pause_tx,
            _aggregate_tx: aggregate_tx,
            worker_cancel,
            link_cancel,
            sample_handle,
            persist_handle,
            link_handles,
        })
    }

    /// Suspends sampling and actuation; the persistence loop keeps running
    /// so an already-collected window is still written out.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Point-in-time view of the whole core for the presentation layer.
    pub async fn snapshot(&self) -> CoreSnapshot {
        let shared = self.shared.lock().await;
        CoreSnapshot {
            latest_aggregate: shared.latest_aggregate.clone(),
            fan: shared.fan.clone(),
            freshener: shared.freshener.clone(),
            occupancy: shared.occupancy.clone(),
            sensor_link: self.sensor_health.borrow().clone(),
            remote_link: self.remote_health.borrow().clone(),
            local_store: shared.local_store.clone(),
            pending_retries: self.gateway.pending_retries().await,
            exhausted_retries: self.gateway.exhausted_retries().await,
        }
    }

    /// Ordered shutdown: stop the workers (the persistence loop persists
    /// the partial window and flushes its retry queue within the
    /// configured bound), then stop the link supervisors.
    pub async fn stop(self) {
        info!("core stopping");
        self.worker_cancel.cancel();
        let _ = self.sample_handle.await;
        let _ = self.persist_handle.await;

        self.link_cancel.cancel();
        for handle in self.link_handles {
            let _ = handle.await;
        }
        info!("core stopped");
    }
}

/// Scalar view of a persisted payload, matching [`Aggregate::scalar`].
fn payload_scalar(payload: &RecordPayload) -> f64 {
    if payload.values.is_empty() {
        return 0.0;
    }
    payload.values.values().sum::<f64>() / payload.values.len() as f64
}
