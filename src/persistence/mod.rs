pub mod local;
pub mod migrations;
pub mod remote;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use log::{error, info, warn};
use tokio::{sync::Mutex, time::Instant};

use crate::{
    errors::{PersistError, RemoteStoreError},
    link::RetryPolicy,
    models::{PersistedRecord, RecordPayload, SyncState},
};

pub use local::SqliteStore;
pub use remote::{RemoteStore, SqliteRemote};

struct RetryState {
    /// SyncFailed records awaiting a retry wave, oldest first. The one
    /// piece of state shared between the persistence tick and the
    /// health-recovered drain; serialized behind this mutex.
    queue: VecDeque<PersistedRecord>,
    /// Records that ran out of retry budget. Kept as a standing warning,
    /// still durable locally, never discarded.
    exhausted: Vec<i64>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

/// Dual-target writer with local-first durability.
///
/// Write order is fixed: the local store always gets the record before the
/// remote store is attempted, and a local failure is fatal-class — it is
/// the only error this gateway returns from [`record`](Self::record). A
/// remote failure just parks the record as `SyncFailed`; the remote link
/// supervisor's health-recovered event drives [`drain_retries`]
/// (Self::drain_retries), which replays oldest-first and idempotently.
/// Repeated consecutive remote failures open a backoff window so a down
/// store is not hammered.
pub struct PersistenceGateway {
    local: SqliteStore,
    remote: Option<Arc<dyn RemoteStore>>,
    retry_budget: u32,
    failure_backoff_threshold: u32,
    backoff: RetryPolicy,
    state: Mutex<RetryState>,
}

impl PersistenceGateway {
    /// Builds the gateway and runs the startup recovery pass: unsynced
    /// local rows from a previous run are loaded straight back into the
    /// retry queue.
    pub async fn new(
        local: SqliteStore,
        remote: Option<Arc<dyn RemoteStore>>,
        retry_budget: u32,
        failure_backoff_threshold: u32,
        backoff: RetryPolicy,
    ) -> Result<Self, PersistError> {
        let mut queue = VecDeque::new();
        let mut exhausted = Vec::new();

        if remote.is_some() {
            for record in local.unsynced_records().await? {
                if record.attempts >= retry_budget {
                    exhausted.push(record.seq);
                } else {
                    queue.push_back(record);
                }
            }
            if !queue.is_empty() || !exhausted.is_empty() {
                info!(
                    "startup recovery: {} records queued for resync, {} past retry budget",
                    queue.len(),
                    exhausted.len()
                );
            }
        }

        Ok(Self {
            local,
            remote,
            retry_budget,
            failure_backoff_threshold,
            backoff,
            state: Mutex::new(RetryState {
                queue,
                exhausted,
                consecutive_failures: 0,
                backoff_until: None,
            }),
        })
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub async fn pending_retries(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn exhausted_retries(&self) -> usize {
        self.state.lock().await.exhausted.len()
    }

    /// Persist one averaged window. Local first, always; then the remote,
    /// independently of the local outcome having succeeded.
    pub async fn record(&self, payload: RecordPayload) -> Result<SyncState, PersistError> {
        let seq = self.local.next_sequence().await?;
        let mut record = PersistedRecord {
            seq,
            remote_id: None,
            timestamp: payload.timestamp,
            payload,
            sync_state: SyncState::PendingLocalOnly,
            attempts: 0,
        };

        self.local.insert_record(&record).await?;

        let Some(remote) = self.remote.clone() else {
            // Local-only deployment: nothing to sync against, the record
            // simply stays pending.
            return Ok(SyncState::PendingLocalOnly);
        };

        if self.in_backoff().await {
            warn!("remote in backoff window, queueing record seq {seq} without attempt");
            record.sync_state = SyncState::SyncFailed;
            record.attempts = 0;
            self.local.mark_sync_failed(seq, 0).await?;
            self.state.lock().await.queue.push_back(record);
            return Ok(SyncState::SyncFailed);
        }

        match self.upsert_remote(&remote, &record).await {
            Ok(remote_id) => {
                self.reconcile(seq, remote_id).await?;
                self.note_success().await;
                Ok(SyncState::Synced)
            }
            Err(err) => {
                warn!("remote write failed for seq {seq}: {err}, queueing for resync");
                record.sync_state = SyncState::SyncFailed;
                record.attempts = 1;
                self.local.mark_sync_failed(seq, 1).await?;
                self.state.lock().await.queue.push_back(record);
                self.note_failure().await;
                Ok(SyncState::SyncFailed)
            }
        }
    }

    /// One retry wave, driven by the remote link's health-recovered event.
    /// Each queued record is attempted at most once per wave, oldest
    /// first; the wave stops at the first failure since the remote is
    /// evidently still unhealthy. Returns how many records synced.
    pub async fn drain_retries(&self) -> Result<usize, PersistError> {
        let Some(remote) = self.remote.clone() else {
            return Ok(0);
        };

        if self.in_backoff().await {
            info!("retry wave skipped: remote backoff window still open");
            return Ok(0);
        }

        let mut synced = 0usize;

        loop {
            let Some(mut record) = self.state.lock().await.queue.pop_front() else {
                break;
            };

            match self.upsert_remote(&remote, &record).await {
                Ok(remote_id) => {
                    self.reconcile(record.seq, remote_id).await?;
                    self.note_success().await;
                    synced += 1;
                }
                Err(err) => {
                    record.attempts += 1;
                    self.local
                        .mark_sync_failed(record.seq, record.attempts)
                        .await?;

                    if record.attempts >= self.retry_budget {
                        error!(
                            "record seq {} exhausted its retry budget ({} attempts); \
                             kept locally, flagged for the operator",
                            record.seq, record.attempts
                        );
                        self.state.lock().await.exhausted.push(record.seq);
                    } else {
                        warn!(
                            "retry failed for seq {} ({err}), attempt {}/{}",
                            record.seq, record.attempts, self.retry_budget
                        );
                        self.state.lock().await.queue.push_front(record);
                    }

                    self.note_failure().await;
                    break;
                }
            }
        }

        if synced > 0 {
            info!("retry wave synced {synced} buffered records to the remote store");
        }

        Ok(synced)
    }

    /// Final shutdown flush: one bounded retry wave. Anything the remote
    /// does not take before the deadline stays SyncFailed locally for the
    /// next startup's recovery pass.
    pub async fn flush(&self, timeout: Duration) -> Result<usize, PersistError> {
        match tokio::time::timeout(timeout, self.drain_retries()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("shutdown flush timed out after {timeout:?}, abandoning in-flight remote writes");
                Ok(0)
            }
        }
    }

    /// Last `limit` remote payloads, chronological; rebuilds trend state
    /// after a restart.
    pub async fn remote_recent(&self, limit: usize) -> Result<Vec<RecordPayload>, PersistError> {
        let Some(remote) = self.remote.clone() else {
            return Ok(Vec::new());
        };

        let payloads = tokio::task::spawn_blocking(move || remote.recent(limit))
            .await
            .map_err(|err| {
                RemoteStoreError::Unavailable(format!("worker join failed: {err}"))
            })??;

        Ok(payloads)
    }

    async fn upsert_remote(
        &self,
        remote: &Arc<dyn RemoteStore>,
        record: &PersistedRecord,
    ) -> Result<String, RemoteStoreError> {
        let remote = Arc::clone(remote);
        let timestamp = record.timestamp.to_rfc3339();
        let seq = record.seq;
        let payload = record.payload.clone();

        tokio::task::spawn_blocking(move || remote.upsert(&timestamp, seq, &payload))
            .await
            .map_err(|err| {
                RemoteStoreError::Unavailable(format!("worker join failed: {err}"))
            })?
    }

    /// Back-fill the remote id into the local row so both stores point at
    /// one logical record. A differing pre-existing id is a reconciliation
    /// conflict: the latest successful remote write wins and the clash is
    /// logged, never silently dropped.
    async fn reconcile(&self, seq: i64, remote_id: String) -> Result<(), PersistError> {
        if let Some(previous) = self.local.mark_synced(seq, remote_id.clone()).await? {
            warn!(
                "reconciliation conflict on seq {seq}: local had remote id {previous}, \
                 remote now reports {remote_id}; keeping the newer id"
            );
        }
        Ok(())
    }

    async fn in_backoff(&self) -> bool {
        let state = self.state.lock().await;
        state
            .backoff_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    async fn note_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        state.backoff_until = None;
    }

    async fn note_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.consecutive_failures >= self.failure_backoff_threshold {
            let over = state.consecutive_failures - self.failure_backoff_threshold + 1;
            let delay = self.backoff.delay_for(over);
            state.backoff_until = Some(Instant::now() + delay);
            warn!(
                "{} consecutive remote failures, backing off {delay:?} before the next wave",
                state.consecutive_failures
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet, HashMap},
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };

    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use crate::models::OccupancySnapshot;

    use super::*;

    /// In-memory remote with controllable availability. `store_then_fail`
    /// simulates a write that lands but whose acknowledgment is lost.
    #[derive(Default)]
    struct MockRemote {
        up: AtomicBool,
        store_then_fail: AtomicBool,
        records: StdMutex<HashMap<(String, i64), String>>,
        upsert_calls: AtomicUsize,
    }

    impl MockRemote {
        fn new(up: bool) -> Arc<Self> {
            let remote = Self::default();
            remote.up.store(up, Ordering::SeqCst);
            Arc::new(remote)
        }

        fn stored_id(&self, timestamp: &str, seq: i64) -> Option<String> {
            self.records
                .lock()
                .unwrap()
                .get(&(timestamp.to_string(), seq))
                .cloned()
        }

        fn record_count(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    impl RemoteStore for MockRemote {
        fn upsert(
            &self,
            timestamp: &str,
            seq: i64,
            _payload: &RecordPayload,
        ) -> Result<String, RemoteStoreError> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);

            if !self.up.load(Ordering::SeqCst) {
                return Err(RemoteStoreError::Unavailable(
                    "connection refused".into(),
                ));
            }

            let mut records = self.records.lock().unwrap();
            let key = (timestamp.to_string(), seq);
            let id = records
                .entry(key)
                .or_insert_with(|| Uuid::new_v4().to_string())
                .clone();

            if self.store_then_fail.swap(false, Ordering::SeqCst) {
                return Err(RemoteStoreError::Unavailable(
                    "ack lost".into(),
                ));
            }

            Ok(id)
        }

        fn recent(
            &self,
            _limit: usize,
        ) -> Result<Vec<RecordPayload>, RemoteStoreError> {
            Ok(Vec::new())
        }

        fn ping(&self) -> Result<(), RemoteStoreError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RemoteStoreError::Unavailable("down".into()))
            }
        }
    }

    fn temp_local() -> (SqliteStore, PathBuf) {
        let path = std::env::temp_dir().join(format!("cubicle-local-{}.db", Uuid::new_v4()));
        (SqliteStore::new(path.clone()).unwrap(), path)
    }

    fn payload_at(secs: u32, value: f64) -> RecordPayload {
        let mut values = BTreeMap::new();
        values.insert("GAS1".to_string(), value);
        RecordPayload {
            timestamp: Utc.with_ymd_and_hms(2026, 8, 29, 10, 0, secs).unwrap(),
            values,
            faulted_channels: BTreeSet::new(),
            fan_active: false,
            freshener_active: false,
            occupancy: OccupancySnapshot::vacant(),
        }
    }

    async fn gateway(
        local: SqliteStore,
        remote: Option<Arc<MockRemote>>,
    ) -> PersistenceGateway {
        PersistenceGateway::new(
            local,
            remote.map(|r| r as Arc<dyn RemoteStore>),
            5,
            // High threshold keeps the backoff window out of the way for
            // tests that exercise retries directly.
            100,
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn healthy_remote_yields_synced_with_matching_ids() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(true);
        let gw = gateway(local.clone(), Some(remote.clone())).await;

        let payload = payload_at(0, 150.0);
        let timestamp = payload.timestamp.to_rfc3339();
        let state = gw.record(payload).await.unwrap();
        assert_eq!(state, SyncState::Synced);

        let stored = local.get_record(1).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert_eq!(stored.remote_id, remote.stored_id(&timestamp, 1));
        assert!(stored.remote_id.is_some());
    }

    #[tokio::test]
    async fn remote_down_marks_record_sync_failed_and_queues_it() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(false);
        let gw = gateway(local.clone(), Some(remote)).await;

        let state = gw.record(payload_at(0, 150.0)).await.unwrap();
        assert_eq!(state, SyncState::SyncFailed);
        assert_eq!(gw.pending_retries().await, 1);

        let stored = local.get_record(1).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::SyncFailed);
        assert!(stored.remote_id.is_none());
    }

    #[tokio::test]
    async fn drain_after_recovery_backfills_remote_id() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(false);
        let gw = gateway(local.clone(), Some(remote.clone())).await;

        let payload = payload_at(0, 150.0);
        let timestamp = payload.timestamp.to_rfc3339();
        gw.record(payload).await.unwrap();

        remote.up.store(true, Ordering::SeqCst);
        let synced = gw.drain_retries().await.unwrap();
        assert_eq!(synced, 1);
        assert_eq!(gw.pending_retries().await, 0);

        let stored = local.get_record(1).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert_eq!(stored.remote_id, remote.stored_id(&timestamp, 1));
    }

    #[tokio::test]
    async fn drain_replays_oldest_first() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(false);
        let gw = gateway(local.clone(), Some(remote.clone())).await;

        gw.record(payload_at(0, 100.0)).await.unwrap();
        gw.record(payload_at(30, 200.0)).await.unwrap();

        remote.up.store(true, Ordering::SeqCst);
        assert_eq!(gw.drain_retries().await.unwrap(), 2);
        assert_eq!(remote.record_count(), 2);
    }

    #[tokio::test]
    async fn lost_ack_replay_creates_no_duplicate() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(true);
        remote.store_then_fail.store(true, Ordering::SeqCst);
        let gw = gateway(local.clone(), Some(remote.clone())).await;

        // Write lands remotely but the acknowledgment is lost.
        let state = gw.record(payload_at(0, 150.0)).await.unwrap();
        assert_eq!(state, SyncState::SyncFailed);
        assert_eq!(remote.record_count(), 1);

        let synced = gw.drain_retries().await.unwrap();
        assert_eq!(synced, 1);
        assert_eq!(remote.record_count(), 1, "replay must upsert, not insert");
    }

    #[tokio::test]
    async fn exhausted_budget_keeps_record_locally_as_warning() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(false);
        let gw = PersistenceGateway::new(
            local.clone(),
            Some(remote.clone() as Arc<dyn RemoteStore>),
            2,
            100,
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
        )
        .await
        .unwrap();

        gw.record(payload_at(0, 150.0)).await.unwrap(); // attempt 1
        gw.drain_retries().await.unwrap(); // attempt 2, budget spent

        assert_eq!(gw.pending_retries().await, 0);
        assert_eq!(gw.exhausted_retries().await, 1);

        let stored = local.get_record(1).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::SyncFailed, "never discarded");
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn consecutive_failures_open_backoff_window() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(false);
        let gw = PersistenceGateway::new(
            local,
            Some(remote.clone() as Arc<dyn RemoteStore>),
            5,
            1,
            RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(60)),
        )
        .await
        .unwrap();

        gw.record(payload_at(0, 150.0)).await.unwrap();
        let calls_after_record = remote.upsert_calls.load(Ordering::SeqCst);

        remote.up.store(true, Ordering::SeqCst);
        assert_eq!(gw.drain_retries().await.unwrap(), 0, "wave skipped in backoff");
        assert_eq!(remote.upsert_calls.load(Ordering::SeqCst), calls_after_record);
    }

    #[tokio::test]
    async fn local_only_mode_records_stay_pending() {
        let (local, _) = temp_local();
        let gw = gateway(local.clone(), None).await;

        let state = gw.record(payload_at(0, 150.0)).await.unwrap();
        assert_eq!(state, SyncState::PendingLocalOnly);
        assert_eq!(gw.drain_retries().await.unwrap(), 0);

        let stored = local.get_record(1).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::PendingLocalOnly);
    }

    #[tokio::test]
    async fn startup_recovery_requeues_unsynced_rows() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(false);

        {
            let gw = gateway(local.clone(), Some(remote.clone())).await;
            gw.record(payload_at(0, 150.0)).await.unwrap();
        }

        // New gateway over the same database, as after a process restart.
        let gw = gateway(local.clone(), Some(remote.clone())).await;
        assert_eq!(gw.pending_retries().await, 1);

        remote.up.store(true, Ordering::SeqCst);
        assert_eq!(gw.drain_retries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_flush_leaves_pending_records_durable() {
        let (local, _) = temp_local();
        let remote = MockRemote::new(false);
        let gw = gateway(local.clone(), Some(remote)).await;

        gw.record(payload_at(0, 100.0)).await.unwrap();
        gw.record(payload_at(30, 200.0)).await.unwrap();
        gw.flush(Duration::from_millis(200)).await.unwrap();

        let unsynced = local.unsynced_records().await.unwrap();
        assert_eq!(unsynced.len(), 2, "still on disk after a failed flush");
    }
}
