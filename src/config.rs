use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ReadLockPolicy;
use crate::conflict::resolution::ConflictResolution;
use crate::errors::{PercolatorError, Result};

/// Bounded retry with capped exponential backoff.
///
/// Used for the read-modify-CAS loop on a single chain and for whole
/// transaction retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 64,
            base_delay_ms: 1,
            max_delay_ms: 50,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Upper bound of the delay after the failed attempt number `attempt`
    /// (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(63);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Delay to sleep after the failed attempt number `attempt`: a random
    /// point in the upper half of [`RetryConfig::backoff`], so that callers
    /// retrying against each other spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = u64::try_from(self.backoff(attempt).as_micros()).unwrap_or(u64::MAX);
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(cap / 2..=cap))
    }
}

/// Polling schedule of the snapshot read visibility wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockWaitConfig {
    /// First poll interval, in milliseconds.
    pub poll_interval_ms: u64,
    /// The interval doubles after each poll up to this bound, in milliseconds.
    pub max_poll_interval_ms: u64,
    /// Overall time a read may wait behind an older writer, in milliseconds.
    pub deadline_ms: u64,
}

impl Default for LockWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            max_poll_interval_ms: 20,
            deadline_ms: 2_000,
        }
    }
}

impl LockWaitConfig {
    pub fn poll_interval(&self, poll: u32) -> Duration {
        let shift = poll.min(63);
        let interval = self.poll_interval_ms.max(1).saturating_mul(1u64 << shift);
        Duration::from_millis(interval.min(self.max_poll_interval_ms.max(1)))
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Configuration of a [`crate::Percolator`] instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercolatorConfig {
    /// Retry budget of a single read-modify-CAS mutation of a chain.
    pub cas_retry: RetryConfig,
    /// Retry budget of whole transactions under [`ConflictResolution::Retry`].
    pub txn_retry: RetryConfig,
    /// Visibility wait of the snapshot read path.
    pub lock_wait: LockWaitConfig,
    /// What the coordinator does with a conflicting attempt.
    pub conflict_resolution: ConflictResolution,
    /// Which reads place a read lock.
    pub read_locks: ReadLockPolicy,
    /// Committed versions kept per chain when it is truncated after a commit.
    pub retained_versions: usize,
}

impl Default for PercolatorConfig {
    fn default() -> Self {
        Self {
            cas_retry: RetryConfig::default(),
            txn_retry: RetryConfig::new(256, 1, 100),
            lock_wait: LockWaitConfig::default(),
            conflict_resolution: ConflictResolution::Retry,
            read_locks: ReadLockPolicy::RepeatedReads,
            retained_versions: 8,
        }
    }
}

impl PercolatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| PercolatorError::ConfigError(e.to_string()))
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PercolatorError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn with_cas_retry(mut self, cas_retry: RetryConfig) -> Self {
        self.cas_retry = cas_retry;
        self
    }

    pub fn with_txn_retry(mut self, txn_retry: RetryConfig) -> Self {
        self.txn_retry = txn_retry;
        self
    }

    pub fn with_lock_wait(mut self, lock_wait: LockWaitConfig) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn with_conflict_resolution(mut self, conflict_resolution: ConflictResolution) -> Self {
        self.conflict_resolution = conflict_resolution;
        self
    }

    pub fn with_read_locks(mut self, read_locks: ReadLockPolicy) -> Self {
        self.read_locks = read_locks;
        self
    }

    pub fn with_retained_versions(mut self, retained_versions: usize) -> Self {
        self.retained_versions = retained_versions;
        self
    }

    /// Retained versions, never less than one.
    pub fn retained(&self) -> usize {
        self.retained_versions.max(1)
    }
}
