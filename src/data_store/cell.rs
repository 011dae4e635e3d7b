use serde::{Deserialize, Serialize};

use crate::{Key, Timestamp, Value};

/// Kind of a lock held on a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// Exclusive lock on staged data that will become a new version.
    Write,
    /// Shared lock pinning the value a transaction saw, without intent to write.
    Read,
}

/// A lock held by the transaction that created the cell.
///
/// The owning transaction is identified by the cell's `ts` (its start
/// timestamp); `primary` is the transaction's coordination anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub primary: Key,
    pub kind: LockKind,
}

/// Whether a staged version became visible or was undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    Commit,
    Rollback,
}

/// Marks that the version staged at `data_ts` was committed (or rolled back)
/// as of the owning cell's `ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub data_ts: Timestamp,
    pub kind: WriteKind,
}

/// One versioned record in a key's history.
///
/// A data cell is created at prewrite time with `data` and `lock` set and
/// `ts` equal to the owner's start timestamp. A write cell carries only
/// `write` and has `ts` equal to the owner's commit timestamp.
///
/// # Examples
///
/// ```
/// use percolator::prelude::*;
///
/// let staged = Cell::locked(5, Some(10), 1, LockKind::Write);
/// assert!(staged.is_locked());
///
/// let record = Cell::write_record(7, 5, WriteKind::Commit);
/// assert!(record.commits(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub ts: Timestamp,
    pub data: Option<Value>,
    pub lock: Option<Lock>,
    pub write: Option<WriteRecord>,
}

impl Cell {
    /// A data cell staged at `ts` and locked on behalf of `primary`.
    pub fn locked(ts: Timestamp, data: Option<Value>, primary: Key, kind: LockKind) -> Self {
        Self {
            ts,
            data,
            lock: Some(Lock { primary, kind }),
            write: None,
        }
    }

    /// A write record at `ts` for the version staged at `data_ts`.
    pub fn write_record(ts: Timestamp, data_ts: Timestamp, kind: WriteKind) -> Self {
        Self {
            ts,
            data: None,
            lock: None,
            write: Some(WriteRecord { data_ts, kind }),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Lock kind, if the cell is locked.
    pub fn lock_kind(&self) -> Option<LockKind> {
        self.lock.map(|lock| lock.kind)
    }

    /// Whether this is a `Commit` write record.
    pub fn is_commit(&self) -> bool {
        matches!(
            self.write,
            Some(WriteRecord {
                kind: WriteKind::Commit,
                ..
            })
        )
    }

    /// Whether this is a `Commit` write record for the version staged at `data_ts`.
    pub fn commits(&self, data_ts: Timestamp) -> bool {
        matches!(
            self.write,
            Some(WriteRecord { data_ts: ts, kind: WriteKind::Commit }) if ts == data_ts
        )
    }
}
