//! Per-key locks tied to a transaction's start timestamp and primary key.
//!
//! A lock lives on the data cell the transaction stages at its start
//! timestamp. Write locks are exclusive; read locks pin the value visible at
//! the start timestamp and are shared with other readers.

use log::{debug, trace};

use crate::conflict::detection::{check_lock, LockCheck};
use crate::data_store::cell::{Cell, Lock, LockKind};
use crate::data_store::cell_store::CellStore;
use crate::data_store::chain::VersionChain;
use crate::errors::{PercolatorError, Result};
use crate::snapshot::visible_value;
use crate::{Key, Timestamp, Value};

/// Stages `data` for `key` under an exclusive write lock.
///
/// If the transaction already holds a lock on the key its pending data is
/// overwritten (several writes to one key in one transaction) and a read lock
/// is upgraded. A conflict is returned without touching the store.
pub fn acquire_write_lock(
    store: &CellStore,
    key: Key,
    start_ts: Timestamp,
    data: Value,
    primary: Key,
) -> Result<()> {
    store.mutate(key, |chain| {
        match check_lock(chain, start_ts, primary, LockKind::Write)? {
            LockCheck::HeldBySelf(kind) => {
                let cell = own_cell(chain, key, start_ts)?;
                cell.data = Some(data);
                cell.lock = Some(Lock {
                    primary,
                    kind: LockKind::Write,
                });
                trace!("Txn {} overrides its {:?} lock on key {}", start_ts, kind, key);
                Ok(())
            }
            LockCheck::Free => {
                chain.insert(Cell::locked(start_ts, Some(data), primary, LockKind::Write));
                Ok(())
            }
            LockCheck::Conflict(conflict) => {
                debug!("Txn {} cannot write key {}: {}", start_ts, key, conflict);
                Err(PercolatorError::TransactionConflict { key, conflict })
            }
        }
    })
}

/// Pins the value of `key` visible at `start_ts` under a shared read lock.
///
/// Returns the pinned value. Later reads of the key by the same transaction
/// hit the pinned cell and are unaffected by commits that land afterwards.
/// Other readers may pin the same key concurrently; a write lock held by
/// another transaction, or a newer commit, is a conflict.
pub fn acquire_read_lock(
    store: &CellStore,
    key: Key,
    start_ts: Timestamp,
    primary: Key,
) -> Result<Option<Value>> {
    store.mutate(key, |chain| {
        match check_lock(chain, start_ts, primary, LockKind::Read)? {
            LockCheck::HeldBySelf(_) => Ok(chain.cell_at(start_ts).and_then(|cell| cell.data)),
            LockCheck::Free => {
                let value = visible_value(key, chain, start_ts)?;
                chain.insert(Cell::locked(start_ts, value, primary, LockKind::Read));
                Ok(value)
            }
            LockCheck::Conflict(conflict) => {
                debug!("Txn {} cannot pin key {}: {}", start_ts, key, conflict);
                Err(PercolatorError::TransactionConflict { key, conflict })
            }
        }
    })
}

/// Clears the lock the transaction holds on `key`.
pub fn release_lock(
    store: &CellStore,
    key: Key,
    start_ts: Timestamp,
    primary: Key,
) -> Result<LockKind> {
    store.mutate(key, |chain| release(chain, key, start_ts, primary))
}

/// Clears the lock on the cell at `start_ts` in `chain` and returns its kind.
///
/// The lock must exist and name `primary`; anything else means the
/// coordinator lost track of its own locks.
pub fn release(
    chain: &mut VersionChain,
    key: Key,
    start_ts: Timestamp,
    primary: Key,
) -> Result<LockKind> {
    let cell = own_cell(chain, key, start_ts)?;
    match cell.lock.take() {
        Some(lock) if lock.primary == primary => Ok(lock.kind),
        Some(lock) => Err(PercolatorError::InvariantViolation(format!(
            "lock at {} on key {} belongs to primary {}, expected {}",
            start_ts, key, lock.primary, primary
        ))),
        None => Err(PercolatorError::InvariantViolation(format!(
            "no lock at {} on key {}",
            start_ts, key
        ))),
    }
}

fn own_cell(chain: &mut VersionChain, key: Key, start_ts: Timestamp) -> Result<&mut Cell> {
    chain.cell_at_mut(start_ts).ok_or_else(|| {
        PercolatorError::InvariantViolation(format!("no cell at {} on key {}", start_ts, key))
    })
}
