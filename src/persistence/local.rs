use std::{
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;

use crate::{
    errors::LocalStoreError,
    models::{PersistedRecord, RecordPayload, SyncState},
};

use super::migrations::run_migrations;

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct SqliteStoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SqliteStoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("failed to send shutdown to local store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("failed to join local store thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, LocalStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| LocalStoreError::Rejected(format!("invalid datetime '{value}': {err}")))
}

fn parse_sync_state(value: &str) -> Result<SyncState, LocalStoreError> {
    SyncState::from_str(value)
        .ok_or_else(|| LocalStoreError::Rejected(format!("unknown sync state '{value}'")))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<PersistedRecord, LocalStoreError> {
    let payload_json: String = row.get(2)?;
    let payload: RecordPayload = serde_json::from_str(&payload_json)
        .map_err(|err| LocalStoreError::Rejected(format!("corrupt payload: {err}")))?;

    Ok(PersistedRecord {
        seq: row.get(0)?,
        timestamp: parse_datetime(&row.get::<_, String>(1)?)?,
        payload,
        remote_id: row.get(3)?,
        sync_state: parse_sync_state(&row.get::<_, String>(4)?)?,
        attempts: row.get::<_, i64>(5)? as u32,
    })
}

/// Local durable store: a single SQLite connection owned by a dedicated
/// worker thread, with async callers bridging over a oneshot reply. The
/// write path always lands here before any remote attempt — this is the
/// durability floor, so any failure out of this store is fatal-class and
/// surfaced rather than retried.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteStoreInner>,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("cubicle-local-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open local SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run local store migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("local store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("local store thread shutting down");
            })
            .context("failed to spawn local store worker thread")?;

        ready_rx
            .recv()
            .context("local store worker exited before signaling readiness")??;

        info!("local store initialized at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(SqliteStoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    async fn execute<F, T>(&self, task: F) -> Result<T, LocalStoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LocalStoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("local store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| LocalStoreError::Unavailable(format!("store thread gone: {err}")))?;

        reply_rx
            .await
            .map_err(|_| LocalStoreError::Unavailable("store thread terminated".into()))?
    }

    /// Next value of the local sequence key. Together with the timestamp
    /// this identifies the logical record across both stores.
    pub async fn next_sequence(&self) -> Result<i64, LocalStoreError> {
        self.execute(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM records",
                [],
                |row| row.get(0),
            )?;
            Ok(max + 1)
        })
        .await
    }

    pub async fn insert_record(&self, record: &PersistedRecord) -> Result<(), LocalStoreError> {
        let record = record.clone();
        self.execute(move |conn| {
            let payload_json = serde_json::to_string(&record.payload)
                .map_err(|err| LocalStoreError::Rejected(format!("unserializable payload: {err}")))?;
            conn.execute(
                "INSERT INTO records (seq, timestamp, payload, remote_id, sync_state, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.seq,
                    record.timestamp.to_rfc3339(),
                    payload_json,
                    record.remote_id,
                    record.sync_state.as_str(),
                    record.attempts as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Reconciliation update: attach the remote-assigned id and mark the
    /// record synced. Returns the previously stored remote id when it
    /// differed — the caller logs that as a reconciliation conflict and the
    /// newer remote write wins.
    pub async fn mark_synced(
        &self,
        seq: i64,
        remote_id: String,
    ) -> Result<Option<String>, LocalStoreError> {
        self.execute(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT remote_id FROM records WHERE seq = ?1",
                    params![seq],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();

            conn.execute(
                "UPDATE records SET remote_id = ?1, sync_state = ?2 WHERE seq = ?3",
                params![remote_id, SyncState::Synced.as_str(), seq],
            )?;

            Ok(existing.filter(|id| *id != remote_id))
        })
        .await
    }

    pub async fn mark_sync_failed(&self, seq: i64, attempts: u32) -> Result<(), LocalStoreError> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE records SET sync_state = ?1, attempts = ?2 WHERE seq = ?3",
                params![SyncState::SyncFailed.as_str(), attempts as i64, seq],
            )?;
            Ok(())
        })
        .await
    }

    /// All records not yet acknowledged by the remote store, oldest first —
    /// the startup recovery pass and the retry queue both feed from this.
    pub async fn unsynced_records(&self) -> Result<Vec<PersistedRecord>, LocalStoreError> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, timestamp, payload, remote_id, sync_state, attempts
                 FROM records
                 WHERE sync_state != 'Synced'
                 ORDER BY timestamp ASC, seq ASC",
            )?;

            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn get_record(&self, seq: i64) -> Result<Option<PersistedRecord>, LocalStoreError> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, timestamp, payload, remote_id, sync_state, attempts
                 FROM records WHERE seq = ?1",
            )?;
            let mut rows = stmt.query(params![seq])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Newest payload on disk; used at startup to restore the visitor
    /// counter.
    pub async fn latest_payload(&self) -> Result<Option<RecordPayload>, LocalStoreError> {
        self.execute(|conn| {
            let payload_json: Option<String> = conn
                .query_row(
                    "SELECT payload FROM records ORDER BY timestamp DESC, seq DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            match payload_json {
                Some(json) => {
                    let payload = serde_json::from_str(&json).map_err(|err| {
                        LocalStoreError::Rejected(format!("corrupt payload: {err}"))
                    })?;
                    Ok(Some(payload))
                }
                None => Ok(None),
            }
        })
        .await
    }
}
