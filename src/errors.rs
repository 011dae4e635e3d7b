use std::time::Duration;

use thiserror::Error;

use crate::conflict::detection::ConflictType;
use crate::{Key, Timestamp};

#[derive(Error, Debug)]
pub enum PercolatorError {
    #[error("Transaction conflict detected on key {key}: {conflict}")]
    TransactionConflict { key: Key, conflict: ConflictType },

    #[error("Contention on key {key}: compare-and-swap failed {attempts} times")]
    Contention { key: Key, attempts: u32 },

    #[error("Timed out after {waited:?} waiting for lock at {lock_ts} on key {key}")]
    LockWaitTimeout {
        key: Key,
        lock_ts: Timestamp,
        waited: Duration,
    },

    #[error("Snapshot at {start_ts} of key {key} is older than its retained history ({horizon})")]
    SnapshotTooOld {
        key: Key,
        start_ts: Timestamp,
        horizon: Timestamp,
    },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Timestamp oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Transaction server is shut down")]
    Shutdown,

    #[error("Transaction gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<PercolatorError>,
    },
}

impl PercolatorError {
    /// Logical write/write or write/read conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PercolatorError::TransactionConflict { .. })
    }

    /// Whether aborting the current attempt and running the whole
    /// transaction again can succeed.
    ///
    /// Conflicts, CAS contention, lock wait timeouts and snapshots older than
    /// the retained history are retriable.
    /// Infrastructure errors are retriable by the caller, not by the
    /// coordinator, so they are not included here.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PercolatorError::TransactionConflict { .. }
                | PercolatorError::Contention { .. }
                | PercolatorError::LockWaitTimeout { .. }
                | PercolatorError::SnapshotTooOld { .. }
        )
    }

    /// Protocol invariant violations. The affected request must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PercolatorError::InvariantViolation(_))
    }

    /// Transient infrastructure failure of the store or the oracle.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            PercolatorError::StorageError(_) | PercolatorError::OracleUnavailable(_)
        )
    }
}

impl From<bincode::Error> for PercolatorError {
    fn from(e: bincode::Error) -> Self {
        PercolatorError::CodecError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PercolatorError>;
