//! Common utilities for percolator integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use percolator::prelude::*;

// --- FaultyKv ---

/// A `KvStore` wrapper that can lose compare-and-swap races on demand or
/// become unreachable.
#[derive(Debug, Default)]
pub struct FaultyKv {
    inner: MemoryKv,
    cas_mismatches: AtomicU32,
    /// Storage key -> (swaps still let through, mismatches to report after).
    key_mismatches: Mutex<HashMap<String, (u32, u32)>>,
    unavailable: AtomicBool,
}

impl FaultyKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` compare-and-swap calls report a mismatch.
    pub fn inject_cas_mismatches(&self, n: u32) {
        self.cas_mismatches.store(n, Ordering::SeqCst);
    }

    /// Lets the next `skip` compare-and-swap calls on `key` through, then
    /// makes the following `n` report a mismatch.
    pub fn fail_cas_on(&self, key: Key, skip: u32, n: u32) {
        self.key_mismatches
            .lock()
            .insert(CellStore::storage_key(key), (skip, n));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PercolatorError::StorageError("store unreachable".to_string()));
        }
        Ok(())
    }
}

impl KvStore for FaultyKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        create_if_absent: bool,
    ) -> Result<CasOutcome> {
        self.check()?;
        let injected = self
            .cas_mismatches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Ok(CasOutcome::Mismatch);
        }
        if let Some((skip, n)) = self.key_mismatches.lock().get_mut(key) {
            if *skip > 0 {
                *skip -= 1;
            } else if *n > 0 {
                *n -= 1;
                return Ok(CasOutcome::Mismatch);
            }
        }
        self.inner.compare_and_swap(key, expected, new, create_if_absent)
    }
}

// --- FlakyOracle ---

/// A `LocalOracle` that can be switched off.
#[derive(Debug, Default)]
pub struct FlakyOracle {
    inner: LocalOracle,
    down: AtomicBool,
}

impl FlakyOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl TimestampOracle for FlakyOracle {
    fn get_timestamp(&self) -> Result<Timestamp> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PercolatorError::OracleUnavailable("oracle down".to_string()));
        }
        self.inner.get_timestamp()
    }
}

// --- Helper Functions ---

/// Configuration with short waits so that tests finish quickly.
pub fn test_config() -> PercolatorConfig {
    PercolatorConfig::default()
        .with_cas_retry(RetryConfig::new(256, 1, 5))
        .with_txn_retry(RetryConfig::new(2_000, 1, 5))
        .with_lock_wait(LockWaitConfig {
            poll_interval_ms: 1,
            max_poll_interval_ms: 5,
            deadline_ms: 2_000,
        })
}

/// Same as `test_config` but conflicts are reported instead of retried.
pub fn fail_config() -> PercolatorConfig {
    test_config().with_conflict_resolution(ConflictResolution::Fail)
}

/// Helper function to create a Percolator instance over an in-memory store.
pub fn setup_percolator(config: PercolatorConfig) -> Arc<Percolator> {
    Arc::new(Percolator::in_memory(config))
}

/// Helper function to create a Percolator instance over a `FaultyKv`.
pub fn setup_faulty(config: PercolatorConfig) -> (Arc<FaultyKv>, Arc<FlakyOracle>, Arc<Percolator>) {
    let kv = Arc::new(FaultyKv::new());
    let oracle = Arc::new(FlakyOracle::new());
    let percolator = Arc::new(Percolator::new(kv.clone(), oracle.clone(), config));
    (kv, oracle, percolator)
}

/// Reads `key` in a fresh single-read transaction.
pub fn read_committed(percolator: &Percolator, key: Key) -> Option<Value> {
    let done = percolator.execute(&[Operation::read(key)]).unwrap();
    done[0].read_value().unwrap()
}

/// Commits `value` to `key` in its own transaction.
pub fn write_committed(percolator: &Percolator, key: Key, value: Value) {
    percolator.execute(&[Operation::write(key, value)]).unwrap();
}

/// Raw chain stored under `key`.
pub fn chain(percolator: &Percolator, key: Key) -> VersionChain {
    percolator.cell_store().read_chain(key).unwrap()
}

/// Whether any cell of `key`'s chain is still locked.
pub fn has_locks(percolator: &Percolator, key: Key) -> bool {
    chain(percolator, key).cells().iter().any(|cell| cell.is_locked())
}
