use std::time::Instant;

use log::{debug, trace};

use crate::config::LockWaitConfig;
use crate::data_store::cell_store::CellStore;
use crate::data_store::chain::VersionChain;
use crate::errors::{PercolatorError, Result};
use crate::{Key, Timestamp, Value};

/// Resolves the value of `key` visible at `start_ts`.
///
/// 1. A cell at exactly `start_ts` is the transaction's own pending write or
///    pinned read and is returned as is.
/// 2. Otherwise the read waits until no transaction that started before
///    `start_ts` holds a write lock on the key, polling with backoff until the
///    configured deadline.
/// 3. The newest `Commit` record older than `start_ts` names the data cell to
///    return. Without one the key has no visible value.
pub fn read(
    store: &CellStore,
    key: Key,
    start_ts: Timestamp,
    wait: &LockWaitConfig,
) -> Result<Option<Value>> {
    let chain = store.read_chain(key)?;
    if let Some(cell) = chain.cell_at(start_ts).filter(|cell| cell.write.is_none()) {
        return Ok(cell.data);
    }
    let chain = wait_for_older_writers(store, key, start_ts, wait, chain)?;
    visible_value(key, &chain, start_ts)
}

/// Re-reads the chain of `key` until no write lock older than `start_ts`
/// remains, starting from an already read `chain`.
pub fn wait_for_older_writers(
    store: &CellStore,
    key: Key,
    start_ts: Timestamp,
    wait: &LockWaitConfig,
    mut chain: VersionChain,
) -> Result<VersionChain> {
    let started = Instant::now();
    let mut poll = 0;
    loop {
        let Some(lock_ts) = chain.write_lock_before(start_ts).map(|cell| cell.ts) else {
            return Ok(chain);
        };

        let waited = started.elapsed();
        if waited >= wait.deadline() {
            debug!(
                "Txn {} gave up waiting for lock at {} on key {} after {:?}",
                start_ts, lock_ts, key, waited
            );
            return Err(PercolatorError::LockWaitTimeout {
                key,
                lock_ts,
                waited,
            });
        }

        trace!("Txn {} waits for lock at {} on key {}", start_ts, lock_ts, key);
        std::thread::sleep(wait.poll_interval(poll));
        poll += 1;
        chain = store.read_chain(key)?;
    }
}

/// Value of `key` visible at `start_ts` in `chain`, without waiting.
pub fn visible_value(key: Key, chain: &VersionChain, start_ts: Timestamp) -> Result<Option<Value>> {
    if let Some(cell) = chain.cell_at(start_ts).filter(|cell| cell.write.is_none()) {
        return Ok(cell.data);
    }
    if start_ts < chain.horizon() {
        return Err(PercolatorError::SnapshotTooOld {
            key,
            start_ts,
            horizon: chain.horizon(),
        });
    }

    let Some(write) = chain.latest_commit_before(start_ts) else {
        return Ok(None);
    };
    match chain.cell_at(write.data_ts) {
        Some(cell) if cell.data.is_some() => Ok(cell.data),
        _ => Err(PercolatorError::InvariantViolation(format!(
            "commit of key {} references missing data at {}",
            key, write.data_ts
        ))),
    }
}
