use std::fmt;

use crate::data_store::cell::LockKind;
use crate::data_store::chain::VersionChain;
use crate::errors::*;
use crate::{Key, Timestamp};

/// Represents the type of conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// Another transaction, started at `ts`, holds a lock on the key.
    ForeignLock { ts: Timestamp },
    /// A version was committed at `ts`, after this transaction's snapshot.
    /// Writing over it would overwrite a version the transaction never saw.
    NewerCommit { ts: Timestamp },
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::ForeignLock { ts } => write!(f, "other lock at {}", ts),
            ConflictType::NewerCommit { ts } => write!(f, "newer commit at {}", ts),
        }
    }
}

/// Result of inspecting a chain before taking a lock on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCheck {
    /// Nothing prevents the lock.
    Free,
    /// The transaction already holds a lock of the given kind on this key.
    HeldBySelf(LockKind),
    /// The lock cannot be taken.
    Conflict(ConflictType),
}

/// Checks whether the transaction started at `start_ts` may lock `chain`.
///
/// Scans from the newest cell to the oldest and stops at the first cell that
/// decides the outcome:
/// - a lock at `start_ts` is the transaction's own lock and must name the same
///   `primary`; any other owner is an invariant violation. An own read lock
///   facing `Write` intent does not stop the scan: the upgrade is only
///   allowed when no other cell conflicts;
/// - a lock at another timestamp conflicts, except that `Read` intent shares
///   with other transactions' `Read` locks;
/// - a `Commit` record newer than `start_ts` conflicts. This is the
///   write-write conflict detector.
pub fn check_lock(
    chain: &VersionChain,
    start_ts: Timestamp,
    primary: Key,
    intent: LockKind,
) -> Result<LockCheck> {
    let mut held = None;
    for cell in chain.newest_first() {
        if let Some(lock) = cell.lock {
            if cell.ts == start_ts {
                if lock.primary != primary {
                    return Err(PercolatorError::InvariantViolation(format!(
                        "lock at {} belongs to primary {}, expected {}",
                        start_ts, lock.primary, primary
                    )));
                }
                // Upgrading a shared read lock needs the rest of the chain free.
                if intent == LockKind::Read || lock.kind == LockKind::Write {
                    return Ok(LockCheck::HeldBySelf(lock.kind));
                }
                held = Some(lock.kind);
                continue;
            }
            if intent == LockKind::Read && lock.kind == LockKind::Read {
                continue;
            }
            return Ok(LockCheck::Conflict(ConflictType::ForeignLock { ts: cell.ts }));
        }
        if cell.is_commit() && cell.ts > start_ts {
            return Ok(LockCheck::Conflict(ConflictType::NewerCommit { ts: cell.ts }));
        }
    }
    Ok(held.map_or(LockCheck::Free, LockCheck::HeldBySelf))
}
