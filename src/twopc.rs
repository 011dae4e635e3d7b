//! Second phase of the transaction: turning prewrite locks into durable
//! write records, or undoing them.

use log::trace;

use crate::data_store::cell::{Cell, LockKind, WriteKind};
use crate::data_store::cell_store::CellStore;
use crate::data_store::chain::VersionChain;
use crate::errors::{PercolatorError, Result};
use crate::lock::release;
use crate::{Key, Timestamp};

/// Commits the lock the transaction started at `start_ts` holds on `key`.
///
/// A write lock is released and a `Commit` record `{commit_ts, data_ts:
/// start_ts}` is added in the same swap, after which the chain is truncated to
/// `retain` committed versions. A read lock carries no durable write and its
/// pinning cell is dropped.
///
/// `held` is the kind of lock the transaction believes it holds. Committing
/// again after a swap that already went through is a no-op.
pub fn commit_key(
    store: &CellStore,
    key: Key,
    held: LockKind,
    start_ts: Timestamp,
    commit_ts: Timestamp,
    primary: Key,
    retain: usize,
) -> Result<()> {
    store.mutate(key, |chain| {
        let Some(kind) = locked_kind(chain, start_ts) else {
            return already_finished(chain, key, held, start_ts, WriteKind::Commit);
        };
        match kind {
            LockKind::Write => {
                release(chain, key, start_ts, primary)?;
                chain.insert(Cell::write_record(commit_ts, start_ts, WriteKind::Commit));
                let dropped = chain.truncate(retain);
                if dropped > 0 {
                    trace!("Key {} truncated by {} cells", key, dropped);
                }
            }
            LockKind::Read => {
                check_owner(chain, key, start_ts, primary)?;
                chain.remove_at(start_ts);
            }
        }
        Ok(())
    })
}

/// Rolls back the lock the transaction started at `start_ts` holds on `key`.
///
/// Same shape as [`commit_key`] with a `Rollback` record. A read lock's
/// pinning cell is dropped instead of being converted.
pub fn rollback_key(
    store: &CellStore,
    key: Key,
    held: LockKind,
    start_ts: Timestamp,
    rollback_ts: Timestamp,
    primary: Key,
) -> Result<()> {
    store.mutate(key, |chain| {
        let Some(kind) = locked_kind(chain, start_ts) else {
            return already_finished(chain, key, held, start_ts, WriteKind::Rollback);
        };
        match kind {
            LockKind::Write => {
                release(chain, key, start_ts, primary)?;
                chain.insert(Cell::write_record(rollback_ts, start_ts, WriteKind::Rollback));
            }
            LockKind::Read => {
                check_owner(chain, key, start_ts, primary)?;
                chain.remove_at(start_ts);
            }
        }
        Ok(())
    })
}

/// Removes the cell the transaction staged on `key` at `start_ts`.
///
/// Rolls back without a rollback timestamp. The staged data was never
/// committed, so no reader has observed it. A lock that is already gone is
/// fine unless the key holds this transaction's `Commit` record.
pub fn discard_key(
    store: &CellStore,
    key: Key,
    held: LockKind,
    start_ts: Timestamp,
    primary: Key,
) -> Result<()> {
    store.mutate(key, |chain| {
        if locked_kind(chain, start_ts).is_none() {
            let committed = chain.cells().iter().any(|cell| {
                cell.write
                    .is_some_and(|w| w.data_ts == start_ts && w.kind == WriteKind::Commit)
            });
            if committed && held == LockKind::Write {
                return Err(PercolatorError::InvariantViolation(format!(
                    "cannot discard key {}: txn {} already committed it",
                    key, start_ts
                )));
            }
            return Ok(());
        }
        check_owner(chain, key, start_ts, primary)?;
        chain.remove_at(start_ts);
        trace!("Txn {} discarded its cell on key {}", start_ts, key);
        Ok(())
    })
}

fn locked_kind(chain: &VersionChain, start_ts: Timestamp) -> Option<LockKind> {
    chain.cell_at(start_ts).and_then(|cell| cell.lock_kind())
}

fn check_owner(chain: &VersionChain, key: Key, start_ts: Timestamp, primary: Key) -> Result<()> {
    match chain.cell_at(start_ts).and_then(|cell| cell.lock) {
        Some(lock) if lock.primary == primary => Ok(()),
        _ => Err(PercolatorError::InvariantViolation(format!(
            "lock at {} on key {} does not belong to primary {}",
            start_ts, key, primary
        ))),
    }
}

/// The lock is gone. That is fine when this very transition already went
/// through (or the lock was a read pin, which leaves nothing behind); it is
/// an invariant violation otherwise.
fn already_finished(
    chain: &VersionChain,
    key: Key,
    held: LockKind,
    start_ts: Timestamp,
    outcome: WriteKind,
) -> Result<()> {
    let recorded = chain
        .cells()
        .iter()
        .any(|cell| cell.write.is_some_and(|w| w.data_ts == start_ts && w.kind == outcome));
    if recorded || held == LockKind::Read {
        return Ok(());
    }
    Err(PercolatorError::InvariantViolation(format!(
        "lock expected at {} on key {} but not found",
        start_ts, key
    )))
}
