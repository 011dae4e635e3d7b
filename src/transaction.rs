use std::sync::Arc;

use ahash::AHashMap as HashMap;
use log::{debug, error, trace, warn};

use crate::config::{LockWaitConfig, PercolatorConfig, RetryConfig};
use crate::conflict::detection::ConflictType;
use crate::data_store::cell::LockKind;
use crate::data_store::cell_store::CellStore;
use crate::errors::{PercolatorError, Result};
use crate::lock::{acquire_read_lock, acquire_write_lock};
use crate::oracle::TimestampOracle;
use crate::snapshot;
use crate::twopc::{commit_key, discard_key, rollback_key};
use crate::{Key, Timestamp, Value};

/// Lifecycle of a single transaction attempt.
///
/// `Started -> Prewriting -> (Conflict | AllLocksAcquired) -> Committing ->
/// (Committed | Aborted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// The start timestamp is fixed; nothing has been read or locked yet.
    Started,
    /// Reads and lock acquisition are in progress.
    Prewriting,
    /// A lock could not be taken. No further locks are acquired and the
    /// transaction can only be rolled back.
    Conflict,
    /// Every lock is held and the commit timestamp is being obtained.
    AllLocksAcquired,
    /// Locks are being turned into write records.
    Committing,
    /// The primary's commit is durable.
    Committed,
    /// The transaction's locks were rolled back or abandoned.
    Aborted,
}

/// One attempt of a snapshot-isolated transaction.
///
/// A transaction reads the snapshot fixed at its start timestamp and stages
/// its writes under locks on the keys it touches. Nothing is visible to other
/// transactions until [`Transaction::commit`] turns the lock of the primary
/// key into a `Commit` record; the secondaries follow.
///
/// Every lock names the transaction's primary key. The primary is either set
/// up front with [`Transaction::set_primary`] or defaults to the first key the
/// transaction locks.
///
/// Dropping a transaction that still holds locks rolls them back on a best
/// effort basis.
///
/// # Examples
///
/// ```
/// use percolator::prelude::*;
///
/// let percolator = Percolator::in_memory(PercolatorConfig::default());
///
/// let mut txn = percolator.start_transaction().unwrap();
/// txn.write(1, 10).unwrap();
/// assert_eq!(txn.read(1).unwrap(), Some(10));
/// txn.commit().unwrap();
///
/// let mut reader = percolator.start_transaction().unwrap();
/// assert_eq!(reader.read(1).unwrap(), Some(10));
/// ```
pub struct Transaction {
    store: CellStore,
    oracle: Arc<dyn TimestampOracle>,
    lock_wait: LockWaitConfig,
    /// Rounds over the secondaries once the primary is committed.
    roll_forward_retry: RetryConfig,
    retained: usize,
    start_ts: Timestamp,
    primary: Option<Key>,
    /// Locks held, in acquisition order.
    locks: Vec<(Key, LockKind)>,
    /// Key -> position in `locks`.
    held: HashMap<Key, usize>,
    state: TxnState,
    conflict: Option<(Key, ConflictType)>,
}

impl Transaction {
    /// Starts a transaction at a fresh timestamp from `oracle`.
    ///
    /// # Errors
    ///
    /// Fails with the oracle's error when no timestamp can be obtained. No
    /// work has been done at that point.
    pub fn begin(
        store: CellStore,
        oracle: Arc<dyn TimestampOracle>,
        config: &PercolatorConfig,
    ) -> Result<Self> {
        let start_ts = oracle.get_timestamp()?;
        trace!("Txn {} started", start_ts);
        Ok(Self {
            store,
            oracle,
            lock_wait: config.lock_wait,
            roll_forward_retry: config.txn_retry,
            retained: config.retained(),
            start_ts,
            primary: None,
            locks: Vec::new(),
            held: HashMap::new(),
            state: TxnState::Started,
            conflict: None,
        })
    }

    /// Start timestamp, which also identifies the transaction's locks.
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn primary(&self) -> Option<Key> {
        self.primary
    }

    /// Keys locked so far with the kind of lock held, in acquisition order.
    pub fn locks(&self) -> &[(Key, LockKind)] {
        &self.locks
    }

    /// Fixes the primary key before any lock is taken.
    ///
    /// # Errors
    ///
    /// Returns [`PercolatorError::InvariantViolation`] if locks were already
    /// taken under a different primary.
    pub fn set_primary(&mut self, key: Key) -> Result<()> {
        match self.primary {
            Some(primary) if primary != key && !self.locks.is_empty() => {
                Err(PercolatorError::InvariantViolation(format!(
                    "txn {} already locks under primary {}, cannot switch to {}",
                    self.start_ts, primary, key
                )))
            }
            _ => {
                self.primary = Some(key);
                Ok(())
            }
        }
    }

    /// Reads the value of `key` visible at the start timestamp.
    ///
    /// The transaction's own staged write (or pinned read) of the key is
    /// returned as is. Otherwise the read waits for transactions that started
    /// earlier and still hold a write lock on the key, then returns the value
    /// of the newest commit before the start timestamp, or `None`.
    ///
    /// # Errors
    ///
    /// - [`PercolatorError::LockWaitTimeout`] if an older writer holds its
    ///   lock past the configured deadline.
    /// - [`PercolatorError::SnapshotTooOld`] if the history the snapshot needs
    ///   was truncated.
    /// - Store errors.
    pub fn read(&mut self, key: Key) -> Result<Option<Value>> {
        self.prewriting()?;
        snapshot::read(&self.store, key, self.start_ts, &self.lock_wait)
    }

    /// Reads `key` like [`Transaction::read`] and pins the value under a read
    /// lock.
    ///
    /// Later reads of the key within this transaction return the pinned value
    /// even if another transaction commits a new one in between. Read locks
    /// are shared between readers but conflict with writers.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::read`], plus [`PercolatorError::TransactionConflict`]
    /// when another transaction holds a write lock on the key or committed it
    /// after this transaction's start.
    pub fn read_pinned(&mut self, key: Key) -> Result<Option<Value>> {
        self.prewriting()?;
        if self.held.contains_key(&key) {
            return snapshot::read(&self.store, key, self.start_ts, &self.lock_wait);
        }

        let chain = self.store.read_chain(key)?;
        snapshot::wait_for_older_writers(&self.store, key, self.start_ts, &self.lock_wait, chain)?;
        let primary = self.primary_for(key);
        let result = acquire_read_lock(&self.store, key, self.start_ts, primary);
        let value = self.track(key, result)?;
        self.record_lock(key, LockKind::Read);
        Ok(value)
    }

    /// Stages `value` for `key` under an exclusive write lock.
    ///
    /// Writing a key twice replaces the staged value, and writing a key this
    /// transaction pinned upgrades the read lock.
    ///
    /// # Errors
    ///
    /// [`PercolatorError::TransactionConflict`] when the key is locked by
    /// another transaction or was committed after this transaction's start.
    /// The transaction moves to [`TxnState::Conflict`] and must be rolled
    /// back.
    pub fn write(&mut self, key: Key, value: Value) -> Result<()> {
        self.prewriting()?;
        let primary = self.primary_for(key);
        let result = acquire_write_lock(&self.store, key, self.start_ts, value, primary);
        self.track(key, result)?;
        self.record_lock(key, LockKind::Write);
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// The primary key is committed first; once its `Commit` record is
    /// durable the transaction is committed and the secondaries follow. Read
    /// locks leave nothing behind.
    ///
    /// Returns the commit timestamp. A transaction without write locks needs
    /// none and returns its start timestamp, the point its reads were taken
    /// at.
    ///
    /// # Errors
    ///
    /// - The stored conflict if the transaction is in [`TxnState::Conflict`].
    /// - Oracle or store errors before the primary is committed. The
    ///   transaction is then rolled back when dropped.
    ///
    /// Once the primary is committed no error is returned. Secondaries that
    /// fail are retried with backoff; a secondary that still fails after the
    /// last round keeps its lock and is logged.
    pub fn commit(mut self) -> Result<Timestamp> {
        if let Some((key, conflict)) = self.conflict {
            return Err(PercolatorError::TransactionConflict { key, conflict });
        }
        self.state = TxnState::AllLocksAcquired;

        let has_writes = self.locks.iter().any(|(_, kind)| *kind == LockKind::Write);
        let commit_ts = if has_writes {
            self.oracle.get_timestamp()?
        } else {
            self.start_ts
        };
        let Some(primary) = self.primary.filter(|_| !self.locks.is_empty()) else {
            self.state = TxnState::Committed;
            return Ok(commit_ts);
        };

        self.state = TxnState::Committing;
        let primary_kind = self.held_kind(primary)?;
        if let Err(e) = commit_key(
            &self.store,
            primary,
            primary_kind,
            self.start_ts,
            commit_ts,
            primary,
            self.retained,
        ) {
            if e.is_fatal() {
                self.abandon_locks(&e);
            }
            return Err(e);
        }
        self.state = TxnState::Committed;
        debug!("Txn {} committed at {} (primary {})", self.start_ts, commit_ts, primary);

        self.roll_forward(primary, commit_ts);
        self.locks.clear();
        self.held.clear();
        Ok(commit_ts)
    }

    /// Rolls back every lock the transaction holds.
    ///
    /// Write locks become `Rollback` records; read locks are dropped. When the
    /// oracle cannot hand out a rollback timestamp the staged cells are
    /// removed instead. Every key is attempted even if one fails, and the
    /// first error is returned.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_locks()
    }

    /// Gives up the transaction without touching the store.
    ///
    /// Used when the transaction's view of its own locks can no longer be
    /// trusted. Its locks stay behind.
    pub fn abandon(mut self) {
        let reason = PercolatorError::InvariantViolation("abandoned".to_string());
        self.abandon_locks(&reason);
    }

    fn rollback_locks(&mut self) -> Result<()> {
        self.state = TxnState::Aborted;
        if self.locks.is_empty() {
            return Ok(());
        }
        // Read pins leave nothing behind and need no timestamp. Without a
        // rollback timestamp the staged writes, which no reader has seen,
        // are discarded instead.
        let has_writes = self.locks.iter().any(|(_, kind)| *kind == LockKind::Write);
        let rollback_ts = if has_writes {
            match self.oracle.get_timestamp() {
                Ok(ts) => Some(ts),
                Err(e) => {
                    warn!(
                        "Txn {} has no rollback timestamp ({}), discarding its staged writes",
                        self.start_ts, e
                    );
                    None
                }
            }
        } else {
            Some(self.start_ts)
        };

        let primary = self.primary.unwrap_or(self.locks[0].0);
        let mut order: Vec<(Key, LockKind)> = self.locks.clone();
        order.sort_by_key(|(key, _)| *key != primary);

        let mut first_error = None;
        for (key, kind) in order {
            let result = match rollback_ts {
                Some(ts) => rollback_key(&self.store, key, kind, self.start_ts, ts, primary),
                None => discard_key(&self.store, key, kind, self.start_ts, primary),
            };
            match result {
                Ok(()) => {
                    if let Some(at) = self.held.remove(&key) {
                        trace!("Txn {} rolled back key {} (lock #{})", self.start_ts, key, at);
                    }
                }
                Err(e) => {
                    warn!("Txn {} failed to roll back key {}: {}", self.start_ts, key, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.locks.retain(|(key, _)| self.held.contains_key(key));
        debug!("Txn {} rolled back", self.start_ts);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Commits the secondaries of a transaction whose primary is committed.
    fn roll_forward(&self, primary: Key, commit_ts: Timestamp) {
        let mut pending: Vec<(Key, LockKind)> = self
            .locks
            .iter()
            .copied()
            .filter(|(key, _)| *key != primary)
            .collect();
        let rounds = self.roll_forward_retry.attempts();
        for round in 0..rounds {
            pending.retain(|&(key, kind)| {
                match commit_key(
                    &self.store,
                    key,
                    kind,
                    self.start_ts,
                    commit_ts,
                    primary,
                    self.retained,
                ) {
                    Ok(()) => false,
                    Err(e) if e.is_fatal() => {
                        error!("Txn {} cannot commit secondary key {}: {}", self.start_ts, key, e);
                        false
                    }
                    Err(e) => {
                        debug!(
                            "Txn {} secondary key {} failed in round {}: {}",
                            self.start_ts,
                            key,
                            round + 1,
                            e
                        );
                        true
                    }
                }
            });
            if pending.is_empty() {
                return;
            }
            if round + 1 < rounds {
                std::thread::sleep(self.roll_forward_retry.delay(round));
            }
        }
        for (key, _) in pending {
            error!(
                "Txn {} committed at {} but secondary key {} is still locked",
                self.start_ts, commit_ts, key
            );
        }
    }

    fn abandon_locks(&mut self, reason: &PercolatorError) {
        if !self.locks.is_empty() {
            error!(
                "Txn {} abandons {} locks: {}",
                self.start_ts,
                self.locks.len(),
                reason
            );
        }
        self.locks.clear();
        self.held.clear();
        self.state = TxnState::Aborted;
    }

    fn prewriting(&mut self) -> Result<()> {
        if let Some((key, conflict)) = self.conflict {
            return Err(PercolatorError::TransactionConflict { key, conflict });
        }
        self.state = TxnState::Prewriting;
        Ok(())
    }

    fn primary_for(&mut self, key: Key) -> Key {
        *self.primary.get_or_insert(key)
    }

    fn track<T>(&mut self, key: Key, result: Result<T>) -> Result<T> {
        if let Err(PercolatorError::TransactionConflict { conflict, .. }) = &result {
            self.conflict = Some((key, *conflict));
            self.state = TxnState::Conflict;
        }
        result
    }

    fn record_lock(&mut self, key: Key, kind: LockKind) {
        match self.held.get(&key) {
            Some(&at) => {
                if kind == LockKind::Write {
                    self.locks[at].1 = LockKind::Write;
                }
            }
            None => {
                self.held.insert(key, self.locks.len());
                self.locks.push((key, kind));
            }
        }
    }

    fn held_kind(&self, key: Key) -> Result<LockKind> {
        self.held
            .get(&key)
            .map(|&at| self.locks[at].1)
            .ok_or_else(|| {
                PercolatorError::InvariantViolation(format!(
                    "txn {} holds no lock on its primary {}",
                    self.start_ts, key
                ))
            })
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.locks.is_empty() || self.state == TxnState::Committed {
            return;
        }
        debug!("Txn {} dropped with {} locks, rolling back", self.start_ts, self.locks.len());
        if let Err(e) = self.rollback_locks() {
            warn!("Txn {} rollback on drop failed: {}", self.start_ts, e);
        }
    }
}
