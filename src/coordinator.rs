use std::sync::Arc;

use log::{debug, error, warn};

use crate::access_plan::AccessPlan;
use crate::config::{PercolatorConfig, RetryConfig};
use crate::conflict::resolution::ConflictResolution;
use crate::data_store::cell_store::CellStore;
use crate::errors::{PercolatorError, Result};
use crate::kv::{KvStore, MemoryKv};
use crate::operation::{CompletedOp, Operation};
use crate::oracle::{LocalOracle, TimestampOracle};
use crate::transaction::Transaction;

/// Percolator Prelude
pub mod prelude {
    pub use crate::access_plan::*;
    pub use crate::config::*;
    pub use crate::conflict::detection::ConflictType;
    pub use crate::conflict::resolution::*;
    pub use crate::data_store::cell::*;
    pub use crate::data_store::chain::*;
    pub use crate::errors::*;
    pub use crate::kv::*;
    pub use crate::operation::*;
    pub use crate::oracle::*;
    pub use crate::transaction::*;
    pub use crate::*;
}

/// The transaction coordinator.
///
/// Runs requests made of reads and writes on integer keys as snapshot
/// isolated transactions over a [`KvStore`] that offers nothing more than
/// single-key compare-and-swap. Timestamps come from a shared
/// [`TimestampOracle`].
///
/// The coordinator holds no state shared between transactions; any number
/// of threads may call [`Percolator::execute`] on the same instance.
#[derive(Clone)]
pub struct Percolator {
    store: CellStore,
    oracle: Arc<dyn TimestampOracle>,
    config: PercolatorConfig,
}

impl Percolator {
    /// Creates a coordinator over `kv`, taking timestamps from `oracle`.
    pub fn new(
        kv: Arc<dyn KvStore>,
        oracle: Arc<dyn TimestampOracle>,
        config: PercolatorConfig,
    ) -> Self {
        Self {
            store: CellStore::new(kv, config.cas_retry),
            oracle,
            config,
        }
    }

    pub fn with_defaults(kv: Arc<dyn KvStore>, oracle: Arc<dyn TimestampOracle>) -> Self {
        Self::new(kv, oracle, PercolatorConfig::default())
    }

    /// A coordinator over a fresh [`MemoryKv`] with a [`LocalOracle`].
    pub fn in_memory(config: PercolatorConfig) -> Self {
        Self::new(Arc::new(MemoryKv::new()), Arc::new(LocalOracle::new()), config)
    }

    pub fn config(&self) -> &PercolatorConfig {
        &self.config
    }

    /// The versioned cell store the coordinator works on.
    pub fn cell_store(&self) -> &CellStore {
        &self.store
    }

    /// Starts a single transaction attempt.
    ///
    /// The caller drives it through reads, writes and commit. Conflicts are
    /// not retried; see [`Percolator::execute`] for that.
    pub fn start_transaction(&self) -> Result<Transaction> {
        Transaction::begin(self.store.clone(), Arc::clone(&self.oracle), &self.config)
    }

    /// Runs `ops` as one transaction and returns their results in request
    /// order.
    ///
    /// Writes are staged under locks. Reads return the snapshot at the
    /// transaction's start, and keys read more than once are pinned with a
    /// read lock (see [`crate::ReadLockPolicy`]). If every lock is taken the
    /// transaction commits; otherwise its locks are rolled back.
    ///
    /// Under [`ConflictResolution::Retry`] a conflict, CAS contention, a lock
    /// wait timeout or a truncated snapshot makes the whole transaction run
    /// again from a new start timestamp, up to the configured budget. Under
    /// [`ConflictResolution::Fail`] the first such error is returned.
    ///
    /// # Errors
    ///
    /// - [`PercolatorError::TransactionConflict`] (and the other retriable
    ///   errors) under `Fail`.
    /// - [`PercolatorError::RetriesExhausted`] when the retry budget is spent.
    /// - Store and oracle errors, after the attempt's locks were rolled back.
    /// - [`PercolatorError::InvariantViolation`], without any rollback.
    ///
    /// # Examples
    ///
    /// ```
    /// use percolator::prelude::*;
    ///
    /// let percolator = Percolator::in_memory(PercolatorConfig::default());
    /// percolator.execute(&[Operation::write(1, 10)]).unwrap();
    ///
    /// let done = percolator.execute(&[Operation::read(1)]).unwrap();
    /// assert_eq!(done, vec![CompletedOp::Read { key: 1, value: Some(10) }]);
    /// ```
    pub fn execute(&self, ops: &[Operation]) -> Result<Vec<CompletedOp>> {
        let plan = AccessPlan::analyze(ops, self.config.read_locks);
        let retry = match self.config.conflict_resolution {
            ConflictResolution::Retry => self.config.txn_retry,
            ConflictResolution::Fail => RetryConfig::no_retry(),
        };
        let attempts = retry.attempts();

        let mut attempt = 0;
        loop {
            let err = match self.attempt(ops, &plan) {
                Ok(done) => return Ok(done),
                Err(e) => e,
            };
            attempt += 1;
            if !err.is_retriable() || attempts == 1 {
                return Err(err);
            }
            if attempt >= attempts {
                warn!("Transaction gave up after {} attempts: {}", attempts, err);
                return Err(PercolatorError::RetriesExhausted {
                    attempts,
                    source: Box::new(err),
                });
            }
            debug!("Transaction attempt {} failed, retrying: {}", attempt, err);
            std::thread::sleep(retry.delay(attempt - 1));
        }
    }

    fn attempt(&self, ops: &[Operation], plan: &AccessPlan) -> Result<Vec<CompletedOp>> {
        let mut txn = self.start_transaction()?;
        if let Some(primary) = plan.primary() {
            txn.set_primary(primary)?;
        }

        let mut done = Vec::with_capacity(ops.len());
        for op in ops {
            let step = match *op {
                Operation::Read { key } if plan.pins(key) => txn
                    .read_pinned(key)
                    .map(|value| CompletedOp::Read { key, value }),
                Operation::Read { key } => {
                    txn.read(key).map(|value| CompletedOp::Read { key, value })
                }
                Operation::Write { key, value } => txn
                    .write(key, value)
                    .map(|()| CompletedOp::Write { key, value }),
            };
            match step {
                Ok(completed) => done.push(completed),
                Err(e) => return Err(Self::abort(txn, e)),
            }
        }

        txn.commit()?;
        Ok(done)
    }

    /// Ends a failed attempt. The attempt's error is what the caller sees,
    /// even if the rollback fails too.
    fn abort(txn: Transaction, err: PercolatorError) -> PercolatorError {
        let start_ts = txn.start_ts();
        if err.is_fatal() {
            error!("Txn {} hit an invariant violation: {}", start_ts, err);
            txn.abandon();
            return err;
        }
        if let Err(e) = txn.rollback() {
            warn!("Txn {} rollback failed: {}", start_ts, e);
        }
        err
    }
}
