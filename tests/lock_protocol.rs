use std::sync::Arc;

use percolator::conflict::detection::{LockCheck, check_lock};
use percolator::lock::{acquire_read_lock, acquire_write_lock, release_lock};
use percolator::prelude::*;
use percolator::twopc::{commit_key, rollback_key};

fn store() -> CellStore {
    CellStore::new(Arc::new(MemoryKv::new()), RetryConfig::default())
}

fn committed(data_ts: Timestamp, commit_ts: Timestamp, value: Value) -> Vec<Cell> {
    vec![
        Cell {
            ts: data_ts,
            data: Some(value),
            lock: None,
            write: None,
        },
        Cell::write_record(commit_ts, data_ts, WriteKind::Commit),
    ]
}

#[test]
fn test_check_lock_on_empty_chain_is_free() {
    let chain = VersionChain::new();
    assert_eq!(check_lock(&chain, 5, 1, LockKind::Write).unwrap(), LockCheck::Free);
}

#[test]
fn test_check_lock_sees_foreign_lock() {
    let chain = VersionChain::from_cells(vec![Cell::locked(3, Some(1), 9, LockKind::Write)]);
    assert_eq!(
        check_lock(&chain, 5, 1, LockKind::Write).unwrap(),
        LockCheck::Conflict(ConflictType::ForeignLock { ts: 3 })
    );
    assert_eq!(
        check_lock(&chain, 5, 1, LockKind::Read).unwrap(),
        LockCheck::Conflict(ConflictType::ForeignLock { ts: 3 })
    );
}

#[test]
fn test_check_lock_sees_newer_commit() {
    let chain = VersionChain::from_cells(committed(6, 8, 1));
    assert_eq!(
        check_lock(&chain, 5, 1, LockKind::Write).unwrap(),
        LockCheck::Conflict(ConflictType::NewerCommit { ts: 8 })
    );
    assert_eq!(check_lock(&chain, 9, 1, LockKind::Write).unwrap(), LockCheck::Free);
}

#[test]
fn test_check_lock_own_lock_with_wrong_primary_is_fatal() {
    let chain = VersionChain::from_cells(vec![Cell::locked(5, Some(1), 2, LockKind::Write)]);
    assert_eq!(
        check_lock(&chain, 5, 2, LockKind::Write).unwrap(),
        LockCheck::HeldBySelf(LockKind::Write)
    );
    let err = check_lock(&chain, 5, 3, LockKind::Write).unwrap_err();
    assert!(err.is_fatal());
    assert!(!err.is_retriable());
}

#[test]
fn test_read_locks_are_shared() {
    let chain = VersionChain::from_cells(vec![Cell::locked(3, None, 3, LockKind::Read)]);
    assert_eq!(check_lock(&chain, 5, 5, LockKind::Read).unwrap(), LockCheck::Free);
    assert_eq!(
        check_lock(&chain, 5, 5, LockKind::Write).unwrap(),
        LockCheck::Conflict(ConflictType::ForeignLock { ts: 3 })
    );
}

#[test]
fn test_read_lock_upgrade_needs_sole_reader() {
    let shared = VersionChain::from_cells(vec![
        Cell::locked(3, None, 3, LockKind::Read),
        Cell::locked(5, None, 5, LockKind::Read),
    ]);
    assert_eq!(
        check_lock(&shared, 5, 5, LockKind::Write).unwrap(),
        LockCheck::Conflict(ConflictType::ForeignLock { ts: 3 })
    );

    let alone = VersionChain::from_cells(vec![Cell::locked(5, None, 5, LockKind::Read)]);
    assert_eq!(
        check_lock(&alone, 5, 5, LockKind::Write).unwrap(),
        LockCheck::HeldBySelf(LockKind::Read)
    );
}

#[test]
fn test_write_lock_lifecycle() {
    let store = store();
    acquire_write_lock(&store, 1, 5, 10, 1).unwrap();

    let chain = store.read_chain(1).unwrap();
    assert_eq!(chain.cells(), &[Cell::locked(5, Some(10), 1, LockKind::Write)]);

    let err = acquire_write_lock(&store, 1, 6, 20, 1).unwrap_err();
    assert!(err.is_conflict());
    // A conflict does not touch the store.
    assert_eq!(store.read_chain(1).unwrap(), chain);

    // Same transaction overrides its own pending data.
    acquire_write_lock(&store, 1, 5, 11, 1).unwrap();
    assert_eq!(store.read_chain(1).unwrap().cell_at(5).unwrap().data, Some(11));

    assert_eq!(release_lock(&store, 1, 5, 1).unwrap(), LockKind::Write);
    assert!(!store.read_chain(1).unwrap().cell_at(5).unwrap().is_locked());
    assert!(release_lock(&store, 1, 5, 1).unwrap_err().is_fatal());
}

#[test]
fn test_read_lock_pins_visible_value() {
    let store = store();
    acquire_write_lock(&store, 1, 2, 10, 1).unwrap();
    commit_key(&store, 1, LockKind::Write, 2, 3, 1, 8).unwrap();

    assert_eq!(acquire_read_lock(&store, 1, 5, 1).unwrap(), Some(10));
    assert_eq!(acquire_read_lock(&store, 1, 6, 1).unwrap(), Some(10));
    assert_eq!(store.read_chain(1).unwrap().read_lock_holders(), 2);

    // Pinning again is a no-op.
    assert_eq!(acquire_read_lock(&store, 1, 5, 1).unwrap(), Some(10));
    assert_eq!(store.read_chain(1).unwrap().read_lock_holders(), 2);

    rollback_key(&store, 1, LockKind::Read, 5, 7, 1).unwrap();
    commit_key(&store, 1, LockKind::Read, 6, 8, 1, 8).unwrap();
    assert_eq!(store.read_chain(1).unwrap().read_lock_holders(), 0);
    assert_eq!(store.read_chain(1).unwrap().len(), 2);
}

#[test]
fn test_commit_is_idempotent() {
    let store = store();
    acquire_write_lock(&store, 1, 5, 10, 1).unwrap();
    commit_key(&store, 1, LockKind::Write, 5, 7, 1, 8).unwrap();
    let once = store.read_chain(1).unwrap();
    commit_key(&store, 1, LockKind::Write, 5, 7, 1, 8).unwrap();
    assert_eq!(store.read_chain(1).unwrap(), once);

    // Rolling back a committed write finds no lock and no rollback record.
    assert!(rollback_key(&store, 1, LockKind::Write, 5, 9, 1).unwrap_err().is_fatal());
}

#[test]
fn test_rollback_writes_record() {
    let store = store();
    acquire_write_lock(&store, 1, 5, 10, 1).unwrap();
    rollback_key(&store, 1, LockKind::Write, 5, 6, 1).unwrap();

    let chain = store.read_chain(1).unwrap();
    let record = chain.cell_at(6).unwrap().write.unwrap();
    assert_eq!(record.data_ts, 5);
    assert_eq!(record.kind, WriteKind::Rollback);
    assert!(chain.latest_commit_before(100).is_none());
}

#[test]
fn test_chain_queries() {
    let mut cells = committed(2, 3, 1);
    cells.extend(committed(4, 6, 2));
    cells.push(Cell::locked(5, Some(3), 5, LockKind::Write));
    let chain = VersionChain::from_cells(cells);

    assert_eq!(chain.latest_commit_before(6).unwrap().data_ts, 2);
    assert_eq!(chain.latest_commit_before(7).unwrap().data_ts, 4);
    assert_eq!(chain.write_lock_before(6).map(|cell| cell.ts), Some(5));
    assert!(chain.write_lock_before(5).is_none());
    let order: Vec<Timestamp> = chain.newest_first().map(|cell| cell.ts).collect();
    assert_eq!(order, vec![6, 5, 4, 3, 2]);
}

#[test]
fn test_truncate_keeps_locks_and_sets_horizon() {
    let mut cells = Vec::new();
    for v in 0..4u64 {
        cells.extend(committed(10 * v + 1, 10 * v + 2, v as Value));
    }
    cells.push(Cell::locked(5, None, 5, LockKind::Read));
    let mut chain = VersionChain::from_cells(cells);

    let dropped = chain.truncate(2);
    // The first two versions go, the read lock at 5 stays.
    assert_eq!(dropped, 4);
    assert_eq!(chain.horizon(), 22);
    assert!(chain.cell_at(5).is_some());
    assert_eq!(chain.latest_commit_before(100).unwrap().data_ts, 31);
    assert_eq!(chain.truncate(2), 0);
}

#[test]
fn test_chain_encoding_remembers_origin() {
    let chain = VersionChain::from_cells(committed(1, 2, 7));
    assert!(chain.origin().is_none());

    let bytes = chain.encode().unwrap();
    let decoded = VersionChain::decode(Some(bytes.clone())).unwrap();
    assert_eq!(decoded, chain);
    assert_eq!(decoded.origin(), Some(bytes.as_slice()));

    assert!(VersionChain::decode(None).unwrap().is_empty());
    assert!(matches!(
        VersionChain::decode(Some(vec![1, 2, 3])),
        Err(PercolatorError::CodecError(_))
    ));
}

#[test]
fn test_memory_kv_compare_and_swap() {
    let kv = MemoryKv::new();
    assert_eq!(
        kv.compare_and_swap("k", None, vec![1], false).unwrap(),
        CasOutcome::Mismatch
    );
    assert_eq!(kv.get("k").unwrap(), None);
    assert_eq!(
        kv.compare_and_swap("k", None, vec![1], true).unwrap(),
        CasOutcome::Swapped
    );
    assert_eq!(
        kv.compare_and_swap("k", None, vec![2], true).unwrap(),
        CasOutcome::Mismatch
    );
    assert_eq!(
        kv.compare_and_swap("k", Some([9u8].as_slice()), vec![2], true).unwrap(),
        CasOutcome::Mismatch
    );
    assert_eq!(
        kv.compare_and_swap("k", Some([1u8].as_slice()), vec![2], false).unwrap(),
        CasOutcome::Swapped
    );
    assert_eq!(kv.get("k").unwrap(), Some(vec![2]));
    assert_eq!(kv.len(), 1);
    assert_eq!(kv.operations(), 7);
}
