//! Error types for the Tandem engine.

use crate::{EntityKind, Version};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: EntityKind, reason: String },

    #[error("payload kind mismatch: record is {record}, payload is {payload}")]
    KindMismatch {
        record: EntityKind,
        payload: EntityKind,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    // Storage errors
    #[error("embedded storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Lifecycle errors
    #[error("engine not initialized")]
    NotInitialized,

    #[error("schema migration failed at version {version}: {reason}")]
    SchemaMigrationFailed { version: Version, reason: String },

    // Sync errors
    #[error("remote store unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("ambiguous conflict for {0}")]
    ConflictResolutionAmbiguous(String),

    #[error("queue item {id} exhausted {retries} retries")]
    QueueRetryExhausted { id: String, retries: u32 },

    // Backup errors
    #[error("invalid backup: {0}")]
    BackupInvalid(String),

    #[error("restore aborted, local state rolled back: {0}")]
    RestoreAborted(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
