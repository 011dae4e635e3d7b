use ahash::{AHashMap as HashMap, AHashSet as HashSet};

use crate::operation::Operation;
use crate::{Key, ReadLockPolicy};

/// What a transaction request will lock, worked out before prewrite starts.
///
/// A read that is not pinned can see a different value the next time the key
/// is read if another transaction commits in between. The plan lists the keys
/// whose first read must place a read lock so that every later access of the
/// key in the same request sees the pinned value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPlan {
    primary: Option<Key>,
    pinned: HashSet<Key>,
}

impl AccessPlan {
    /// Plans the locks of `ops` under `policy`.
    pub fn analyze(ops: &[Operation], policy: ReadLockPolicy) -> Self {
        let pinned: HashSet<Key> = match policy {
            ReadLockPolicy::RepeatedReads => repeated_reads(ops),
            ReadLockPolicy::AllReads => ops
                .iter()
                .filter(|op| !op.is_write())
                .map(|op| op.key())
                .collect(),
        };

        let primary = ops
            .iter()
            .find(|op| op.is_write())
            .or_else(|| ops.iter().find(|op| pinned.contains(&op.key())))
            .map(|op| op.key());

        Self { primary, pinned }
    }

    /// Coordination anchor of the transaction: the first written key, or the
    /// first pinned key of a request without writes. `None` when the request
    /// takes no locks at all.
    pub fn primary(&self) -> Option<Key> {
        self.primary
    }

    /// Whether the first read of `key` places a read lock.
    pub fn pins(&self, key: Key) -> bool {
        self.pinned.contains(&key)
    }

    /// Pinned keys in ascending order.
    pub fn pinned_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.pinned.iter().copied().collect();
        keys.sort_unstable();
        keys
    }
}

/// Keys that are read and then touched again, by a read or a write, later in
/// the same request.
///
/// A key written before its first read needs no pin: the read sees the
/// transaction's own staged write.
pub fn repeated_reads(ops: &[Operation]) -> HashSet<Key> {
    // Key -> whether it was read before any write to it.
    let mut read_first: HashMap<Key, bool> = HashMap::new();
    let mut repeated = HashSet::new();
    for op in ops {
        let key = op.key();
        match read_first.get(&key) {
            Some(true) => {
                repeated.insert(key);
            }
            Some(false) => {}
            None => {
                read_first.insert(key, !op.is_write());
            }
        }
    }
    repeated
}

