use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;

use crate::errors::Result;

/// Outcome of a [`KvStore::compare_and_swap`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The stored value matched `expected` and was replaced.
    Swapped,
    /// The stored value did not match `expected`; nothing was written.
    Mismatch,
}

/// Trait for the remote key-value service the transaction engine runs on.
///
/// The store is linearizable per key and offers no multi-key atomicity. Values
/// are opaque bytes compared and swapped as a whole. Implementations must be
/// `Send` and `Sync` since every transaction runs on its own thread.
///
/// Unreachable stores report [`crate::PercolatorError::StorageError`].
pub trait KvStore: Send + Sync {
    /// Reads the value stored at `key`, `None` if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically replaces the value at `key` with `new` if it currently equals
    /// `expected`.
    ///
    /// `expected == None` means the key is expected to be absent, in which case
    /// the key is only created when `create_if_absent` is set. An absent key
    /// never matches `Some(_)`.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        create_if_absent: bool,
    ) -> Result<CasOutcome>;
}

/// In-process linearizable [`KvStore`].
///
/// A single mutex serializes every operation, which makes each key trivially
/// linearizable. Used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: Mutex<HashMap<String, Vec<u8>>>,
    operations: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` and `compare_and_swap` calls served so far.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.lock().get(key).cloned())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        create_if_absent: bool,
    ) -> Result<CasOutcome> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock();
        let matches = match (data.get(key), expected) {
            (Some(current), Some(expected)) => current.as_slice() == expected,
            (None, None) => create_if_absent,
            _ => false,
        };
        if !matches {
            return Ok(CasOutcome::Mismatch);
        }
        data.insert(key.to_string(), new);
        Ok(CasOutcome::Swapped)
    }
}
