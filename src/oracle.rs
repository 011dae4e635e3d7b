use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::Timestamp;
use crate::config::RetryConfig;
use crate::errors::{PercolatorError, Result};
use crate::kv::{CasOutcome, KvStore};

/// Client of the timestamp oracle.
///
/// Timestamps returned to any caller, across the whole cluster, are strictly
/// increasing and never reused. An unreachable oracle reports
/// [`PercolatorError::OracleUnavailable`] and the caller must not start (or
/// continue) the transaction.
pub trait TimestampOracle: Send + Sync {
    fn get_timestamp(&self) -> Result<Timestamp>;
}

/// Process-local oracle backed by an atomic counter. The first timestamp is 1.
#[derive(Debug, Default)]
pub struct LocalOracle {
    counter: AtomicU64,
}

impl LocalOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues after `last`; the next timestamp issued is `last + 1`.
    pub fn starting_after(last: Timestamp) -> Self {
        Self {
            counter: AtomicU64::new(last),
        }
    }
}

impl TimestampOracle for LocalOracle {
    fn get_timestamp(&self) -> Result<Timestamp> {
        Ok(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Oracle backed by a linearizable counter kept in a [`KvStore`].
///
/// Every call is a read followed by a compare-and-swap of `counter + 1`, so
/// timestamps stay unique across every process sharing the store.
pub struct KvOracle {
    kv: Arc<dyn KvStore>,
    key: String,
    retry: RetryConfig,
}

impl KvOracle {
    /// Reserved key of the counter. Chains live under decimal integer keys, so
    /// this never collides with data.
    pub const DEFAULT_KEY: &'static str = "__tso__";

    pub fn new(kv: Arc<dyn KvStore>, retry: RetryConfig) -> Self {
        Self::with_key(kv, Self::DEFAULT_KEY, retry)
    }

    pub fn with_key(kv: Arc<dyn KvStore>, key: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            kv,
            key: key.into(),
            retry,
        }
    }
}

impl TimestampOracle for KvOracle {
    fn get_timestamp(&self) -> Result<Timestamp> {
        let unavailable = |e: PercolatorError| PercolatorError::OracleUnavailable(e.to_string());

        for attempt in 0..self.retry.attempts() {
            let current = self.kv.get(&self.key).map_err(unavailable)?;
            let last: Timestamp = match &current {
                Some(bytes) => bincode::deserialize(bytes)?,
                None => 0,
            };
            let next = last + 1;
            let encoded = bincode::serialize(&next)?;
            match self
                .kv
                .compare_and_swap(&self.key, current.as_deref(), encoded, true)
                .map_err(unavailable)?
            {
                CasOutcome::Swapped => return Ok(next),
                CasOutcome::Mismatch => {
                    debug!("Timestamp counter raced at {}, attempt {}", last, attempt + 1);
                    std::thread::sleep(self.retry.delay(attempt));
                }
            }
        }

        warn!(
            "Timestamp counter {} still contended after {} attempts",
            self.key,
            self.retry.attempts()
        );
        Err(PercolatorError::OracleUnavailable(format!(
            "counter {} contended after {} attempts",
            self.key,
            self.retry.attempts()
        )))
    }
}
