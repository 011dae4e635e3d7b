use std::sync::Arc;

use log::{trace, warn};

use crate::config::RetryConfig;
use crate::data_store::chain::VersionChain;
use crate::errors::{PercolatorError, Result};
use crate::kv::{CasOutcome, KvStore};
use crate::Key;

/// Versioned cell store on top of a [`KvStore`].
///
/// This is the only place that talks to the remote store for chain data.
/// Every higher level operation is written as "read chain, compute new chain,
/// compare-and-swap" through [`CellStore::mutate`].
#[derive(Clone)]
pub struct CellStore {
    kv: Arc<dyn KvStore>,
    retry: RetryConfig,
}

impl CellStore {
    pub fn new(kv: Arc<dyn KvStore>, retry: RetryConfig) -> Self {
        Self { kv, retry }
    }

    /// Key under which the chain of `key` is stored.
    pub fn storage_key(key: Key) -> String {
        key.to_string()
    }

    /// Reads the chain of `key`; an absent key is an empty chain.
    pub fn read_chain(&self, key: Key) -> Result<VersionChain> {
        let stored = self.kv.get(&Self::storage_key(key))?;
        VersionChain::decode(stored)
    }

    /// Replaces `expected` with `new` if the store still holds `expected`.
    ///
    /// Returns `Ok(false)` on a compare-and-swap mismatch.
    pub fn try_swap_chain(
        &self,
        key: Key,
        expected: &VersionChain,
        new: &VersionChain,
    ) -> Result<bool> {
        let encoded = new.encode()?;
        let outcome = self.kv.compare_and_swap(
            &Self::storage_key(key),
            expected.origin(),
            encoded,
            expected.origin().is_none(),
        )?;
        Ok(outcome == CasOutcome::Swapped)
    }

    /// Applies `f` to the current chain of `key` and swaps the result in.
    ///
    /// On a mismatch the chain is read again and `f` runs again on the fresh
    /// copy, so `f` must compute its change from the chain it is given. Errors
    /// from `f` abort the loop without touching the store. When `f` leaves the
    /// chain unchanged nothing is written.
    ///
    /// Gives up with [`PercolatorError::Contention`] once the retry budget is
    /// spent.
    pub fn mutate<T, F>(&self, key: Key, mut f: F) -> Result<T>
    where
        F: FnMut(&mut VersionChain) -> Result<T>,
    {
        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            let current = self.read_chain(key)?;
            let mut next = current.clone();
            let out = f(&mut next)?;
            if next == current {
                return Ok(out);
            }
            if self.try_swap_chain(key, &current, &next)? {
                trace!("Key {} swapped to {} cells", key, next.len());
                return Ok(out);
            }
            trace!("Key {} compare-and-swap mismatch, attempt {}", key, attempt + 1);
            std::thread::sleep(self.retry.delay(attempt));
        }

        warn!("Key {} still contended after {} attempts", key, attempts);
        Err(PercolatorError::Contention { key, attempts })
    }
}
