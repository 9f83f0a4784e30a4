use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use log::{error, info};
use tokio::{
    sync::{mpsc, watch, Mutex},
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::PersistError,
    models::{Aggregate, LinkHealth, RecordPayload},
    persistence::PersistenceGateway,
};

use super::SharedState;

/// The long-period worker: collects the sample loop's aggregates into a
/// window and persists one averaged record per persistence tick. Also
/// watches remote-link health and drains the gateway's retry queue on
/// every recovery.
pub(crate) struct PersistWorker {
    pub gateway: Arc<PersistenceGateway>,
    pub aggregate_rx: mpsc::Receiver<Aggregate>,
    pub remote_health: watch::Receiver<LinkHealth>,
    pub shared: Arc<Mutex<SharedState>>,
    pub persist_period: Duration,
    pub flush_timeout: Duration,
    pub cancel: CancellationToken,
}

impl PersistWorker {
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.persist_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so the first
        // record covers a full window.
        ticker.tick().await;

        let mut window: Vec<Aggregate> = Vec::new();

        loop {
            tokio::select! {
                maybe_aggregate = self.aggregate_rx.recv() => {
                    match maybe_aggregate {
                        Some(aggregate) => window.push(aggregate),
                        None => {
                            info!("aggregate channel closed, persistence loop stopping");
                            self.finalize(&mut window).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.persist_window(&mut window).await;
                }
                changed = self.remote_health.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let recovered = self.remote_health.borrow_and_update().is_healthy();
                    if recovered {
                        match self.gateway.drain_retries().await {
                            Ok(0) => {}
                            Ok(n) => info!("remote recovered, resynced {n} buffered records"),
                            Err(err) => error!("retry drain failed: {err}"),
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("persistence loop shutting down, flushing");
                    self.finalize(&mut window).await;
                    break;
                }
            }
        }
    }

    /// Take anything still queued from the sample loop, persist the final
    /// window, then give the gateway one bounded last flush.
    async fn finalize(&mut self, window: &mut Vec<Aggregate>) {
        while let Ok(aggregate) = self.aggregate_rx.try_recv() {
            window.push(aggregate);
        }
        self.persist_window(window).await;
        if let Err(err) = self.gateway.flush(self.flush_timeout).await {
            error!("shutdown flush failed: {err}");
        }
    }

    async fn persist_window(&self, window: &mut Vec<Aggregate>) {
        let Some(averaged) = average_window(window) else {
            return;
        };
        window.clear();

        let payload = {
            let shared = self.shared.lock().await;
            RecordPayload::from_aggregate(
                &averaged,
                shared.fan.is_active,
                shared.freshener.is_active,
                shared.occupancy.clone(),
            )
        };

        match self.gateway.record(payload).await {
            Ok(state) => info!("window persisted, sync state {:?}", state),
            // Local-store failures land here: fatal-class, surfaced, no
            // automatic retry. Latched into the snapshot so the
            // presentation layer shows it, not just the log.
            Err(err) => {
                error!("FAILED TO SAVE DATA: {err}");
                if matches!(err, PersistError::Local(_)) {
                    let mut shared = self.shared.lock().await;
                    shared.local_store = LinkHealth::Fatal(err.to_string());
                }
            }
        }
    }
}

/// Collapse a window of aggregates into one: per-channel mean across the
/// window, union of faulted channels, timestamped at the window's end.
pub(crate) fn average_window(window: &[Aggregate]) -> Option<Aggregate> {
    let last = window.last()?;

    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    let mut faulted: BTreeSet<String> = BTreeSet::new();

    for aggregate in window {
        for (channel, value) in &aggregate.values {
            let entry = sums.entry(channel.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        faulted.extend(aggregate.faulted_channels.iter().cloned());
    }

    let values = sums
        .into_iter()
        .map(|(channel, (sum, count))| (channel, sum / count as f64))
        .collect();

    Some(Aggregate {
        captured_at: last.captured_at,
        values,
        faulted_channels: faulted,
        classification: last.classification,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::{link::RetryPolicy, persistence::SqliteStore};

    use super::*;

    fn aggregate(values: &[(&str, f64)], faulted: &[&str]) -> Aggregate {
        Aggregate {
            captured_at: Utc::now(),
            values: values
                .iter()
                .map(|(c, v)| (c.to_string(), *v))
                .collect(),
            faulted_channels: faulted.iter().map(|c| c.to_string()).collect(),
            classification: None,
        }
    }

    #[test]
    fn empty_window_yields_nothing() {
        assert!(average_window(&[]).is_none());
    }

    #[test]
    fn window_averages_per_channel() {
        let window = vec![
            aggregate(&[("GAS1", 100.0), ("GAS2", 200.0)], &[]),
            aggregate(&[("GAS1", 200.0), ("GAS2", 400.0)], &[]),
        ];

        let averaged = average_window(&window).unwrap();
        assert_eq!(averaged.values["GAS1"], 150.0);
        assert_eq!(averaged.values["GAS2"], 300.0);
    }

    #[tokio::test]
    async fn local_store_failure_latches_fatal_status() {
        let path = std::env::temp_dir().join(format!("cubicle-persist-{}.db", Uuid::new_v4()));
        let local = SqliteStore::new(path.clone()).unwrap();
        let gateway = Arc::new(
            PersistenceGateway::new(
                local,
                None,
                5,
                3,
                RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
            )
            .await
            .unwrap(),
        );

        // Pull the durability floor out from under the worker.
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE records")
            .unwrap();

        let shared = Arc::new(Mutex::new(SharedState::new()));
        let (_aggregate_tx, aggregate_rx) = mpsc::channel(4);
        let (_health_tx, remote_health) = watch::channel(LinkHealth::Healthy);
        let worker = PersistWorker {
            gateway,
            aggregate_rx,
            remote_health,
            shared: Arc::clone(&shared),
            persist_period: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        };

        let mut window = vec![aggregate(&[("GAS1", 120.0)], &[])];
        worker.persist_window(&mut window).await;

        let state = shared.lock().await;
        assert!(matches!(state.local_store, LinkHealth::Fatal(_)));
    }

    #[test]
    fn faulted_channels_union_across_window() {
        let window = vec![
            aggregate(&[("GAS1", 100.0)], &["GAS1"]),
            aggregate(&[("GAS1", 120.0)], &[]),
            aggregate(&[("GAS1", 110.0)], &["GAS1"]),
        ];

        let averaged = average_window(&window).unwrap();
        assert!(averaged.faulted_channels.contains("GAS1"));
    }
}
