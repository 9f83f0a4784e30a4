use std::time::Duration;

use thiserror::Error;

/// Per-channel transport failures. These never escalate past the sampler:
/// the reading is marked invalid and the aggregator substitutes for it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("sensor transport disconnected")]
    Disconnected,

    #[error("channel read timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel read failed: {0}")]
    Read(String),
}

/// Local durable store failures are fatal-class: they are surfaced to the
/// operator and never retried automatically.
#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("local store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("local store rejected record: {0}")]
    Rejected(String),
}

/// Remote store failures are recoverable: the record stays queued locally
/// and is replayed when the link supervisor reports the store healthy again.
#[derive(Debug, Error)]
pub enum RemoteStoreError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store rejected record: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Local(#[from] LocalStoreError),

    #[error(transparent)]
    Remote(#[from] RemoteStoreError),
}
