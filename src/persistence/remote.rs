use std::{path::PathBuf, sync::Mutex};

use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::{errors::RemoteStoreError, models::RecordPayload};

/// Remote persistence backend. Implementations must make `upsert`
/// idempotent on `(timestamp, seq)`: a replay after a lost acknowledgment
/// returns the already-assigned id instead of creating a duplicate.
/// Methods may block; callers dispatch through `spawn_blocking`.
pub trait RemoteStore: Send + Sync {
    /// Write (or re-write) one record, returning the remote-assigned id.
    fn upsert(
        &self,
        timestamp: &str,
        seq: i64,
        payload: &RecordPayload,
    ) -> Result<String, RemoteStoreError>;

    /// Last `limit` payloads in chronological order; used at startup to
    /// rebuild the in-memory trend window.
    fn recent(&self, limit: usize) -> Result<Vec<RecordPayload>, RemoteStoreError>;

    /// Cheap reachability probe for the link supervisor.
    fn ping(&self) -> Result<(), RemoteStoreError>;
}

/// SQLite-backed stand-in for the hosted database, typically pointed at a
/// network mount. Assigns uuid-v4 record ids the way the hosted store
/// assigns ObjectIds, and enforces the `(timestamp, seq)` uniqueness that
/// makes replays safe.
pub struct SqliteRemote {
    conn: Mutex<Connection>,
}

impl SqliteRemote {
    pub fn open(path: PathBuf) -> Result<Self, RemoteStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;
        }

        let conn = Connection::open(&path)
            .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS remote_records (
                 id         TEXT PRIMARY KEY,
                 timestamp  TEXT NOT NULL,
                 source_seq INTEGER NOT NULL,
                 payload    TEXT NOT NULL,
                 UNIQUE (timestamp, source_seq)
             );",
        )
        .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;

        info!("remote store opened at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RemoteStoreError> {
        self.conn
            .lock()
            .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))
    }
}

impl RemoteStore for SqliteRemote {
    fn upsert(
        &self,
        timestamp: &str,
        seq: i64,
        payload: &RecordPayload,
    ) -> Result<String, RemoteStoreError> {
        let conn = self.conn()?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM remote_records WHERE timestamp = ?1 AND source_seq = ?2",
                params![timestamp, seq],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let payload_json = serde_json::to_string(payload)
            .map_err(|err| RemoteStoreError::Rejected(err.to_string()))?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO remote_records (id, timestamp, source_seq, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, timestamp, seq, payload_json],
        )
        .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;

        Ok(id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<RecordPayload>, RemoteStoreError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT payload FROM remote_records
                 ORDER BY timestamp DESC, source_seq DESC
                 LIMIT ?1",
            )
            .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;

        let mut rows = stmt
            .query(params![limit as i64])
            .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;

        let mut payloads: Vec<RecordPayload> = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?
        {
            let json: String = row
                .get(0)
                .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))?;
            let payload = serde_json::from_str(&json)
                .map_err(|err| RemoteStoreError::Rejected(format!("corrupt payload: {err}")))?;
            payloads.push(payload);
        }

        // Newest-first from the query; callers want chronological order.
        payloads.reverse();
        Ok(payloads)
    }

    fn ping(&self) -> Result<(), RemoteStoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|err| RemoteStoreError::Unavailable(err.to_string()))
    }
}
