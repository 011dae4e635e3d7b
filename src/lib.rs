pub mod errors;
pub mod config;
pub mod kv;
pub mod oracle;
pub mod data_store;
pub mod conflict;
pub mod lock;
pub mod snapshot;
pub mod twopc;
pub mod access_plan;
pub mod operation;
pub mod transaction;
pub mod coordinator;
#[cfg(feature = "node")]
pub mod node;

use serde::{Deserialize, Serialize};

// Re-export key types and structs for easier access
pub use errors::{PercolatorError, Result};
pub use config::{LockWaitConfig, PercolatorConfig, RetryConfig};
pub use kv::{CasOutcome, KvStore, MemoryKv};
pub use oracle::{KvOracle, LocalOracle, TimestampOracle};
pub use data_store::cell::{Cell, Lock, LockKind, WriteKind, WriteRecord};
pub use data_store::chain::VersionChain;
pub use data_store::cell_store::CellStore;
pub use conflict::resolution::ConflictResolution;
pub use access_plan::AccessPlan;
pub use operation::{CompletedOp, Operation};
pub use transaction::{Transaction, TxnState};
pub use coordinator::{Percolator, prelude};
#[cfg(feature = "node")]
pub use node::{Reply, TxnServer};

/// Keys of the logical key space. Dense integers by convention.
pub type Key = i64;

/// Values stored against a key.
pub type Value = i64;

/// Logical time issued by a [`TimestampOracle`].
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
///
/// Decides which reads of a transaction place a read lock on the key they read.
pub enum ReadLockPolicy {
    ///
    /// [ReadLockPolicy::RepeatedReads] pins only the keys that a transaction reads and then
    /// touches again later in the same request, either with another read or with a write.
    /// The first read places a read lock that fixes the visible value at the transaction's
    /// start timestamp, and every later access of that key hits the pinned cell instead of
    /// the shared history. Keys read exactly once are read without any lock, which keeps
    /// contention with concurrent writers low.
    #[default]
    RepeatedReads,
    ///
    /// [ReadLockPolicy::AllReads] pins every key the transaction reads. This is the
    /// conservative variant: the transaction conflicts with any concurrent writer of any key
    /// it looked at, at the cost of more aborts under contention.
    AllReads,
}
