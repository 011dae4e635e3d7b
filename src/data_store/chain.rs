use serde::{Deserialize, Serialize};

use crate::data_store::cell::{Cell, LockKind, WriteRecord};
use crate::errors::Result;
use crate::Timestamp;

/// Stored form of a chain.
#[derive(Serialize, Deserialize)]
struct StoredChain {
    horizon: Timestamp,
    cells: Vec<Cell>,
}

/// The ordered history of cells stored under one key.
///
/// The chain is the unit of compare-and-swap: it is read, changed in memory
/// and swapped back as a whole value. It remembers the exact bytes it was
/// decoded from so the swap can use them as the expected value.
///
/// Cells are kept sorted by `ts`. Timestamps are unique, so at most one cell
/// exists per `ts`.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    cells: Vec<Cell>,
    /// Commit timestamp of the oldest version still retained after
    /// truncation. Snapshots at or before it may miss history. Zero while the
    /// full history is present.
    horizon: Timestamp,
    origin: Option<Vec<u8>>,
}

impl PartialEq for VersionChain {
    fn eq(&self, other: &Self) -> bool {
        self.horizon == other.horizon && self.cells == other.cells
    }
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(mut cells: Vec<Cell>) -> Self {
        cells.sort_by_key(|cell| cell.ts);
        Self {
            cells,
            horizon: 0,
            origin: None,
        }
    }

    /// Decodes the value stored at a key. An absent key is an empty chain.
    pub fn decode(stored: Option<Vec<u8>>) -> Result<Self> {
        match stored {
            None => Ok(Self::new()),
            Some(bytes) => {
                let StoredChain { horizon, mut cells } = bincode::deserialize(&bytes)?;
                cells.sort_by_key(|cell| cell.ts);
                Ok(Self {
                    cells,
                    horizon,
                    origin: Some(bytes),
                })
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let stored = StoredChain {
            horizon: self.horizon,
            cells: self.cells.clone(),
        };
        Ok(bincode::serialize(&stored)?)
    }

    /// Bytes this chain was decoded from, `None` if the key did not exist.
    pub fn origin(&self) -> Option<&[u8]> {
        self.origin.as_deref()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn horizon(&self) -> Timestamp {
        self.horizon
    }

    /// Cells from newest to oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().rev()
    }

    /// Inserts a cell at its timestamp position.
    pub fn insert(&mut self, cell: Cell) {
        let at = self.cells.partition_point(|c| c.ts <= cell.ts);
        self.cells.insert(at, cell);
    }

    pub fn cell_at(&self, ts: Timestamp) -> Option<&Cell> {
        self.position(ts).map(|i| &self.cells[i])
    }

    pub fn cell_at_mut(&mut self, ts: Timestamp) -> Option<&mut Cell> {
        let i = self.position(ts)?;
        Some(&mut self.cells[i])
    }

    pub fn remove_at(&mut self, ts: Timestamp) -> Option<Cell> {
        self.position(ts).map(|i| self.cells.remove(i))
    }

    fn position(&self, ts: Timestamp) -> Option<usize> {
        self.cells.binary_search_by_key(&ts, |cell| cell.ts).ok()
    }

    /// Newest write lock held by a transaction that started before `ts`.
    pub fn write_lock_before(&self, ts: Timestamp) -> Option<&Cell> {
        self.newest_first()
            .filter(|cell| cell.ts < ts)
            .find(|cell| cell.lock_kind() == Some(LockKind::Write))
    }

    /// Newest `Commit` record with a commit timestamp before `ts`.
    pub fn latest_commit_before(&self, ts: Timestamp) -> Option<WriteRecord> {
        self.newest_first()
            .filter(|cell| cell.ts < ts && cell.is_commit())
            .find_map(|cell| cell.write)
    }

    /// Number of transactions sharing a read lock on this key.
    pub fn read_lock_holders(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| cell.lock_kind() == Some(LockKind::Read))
            .count()
    }

    /// Drops history older than the `retain` most recent committed versions.
    ///
    /// Locked cells are always kept. Everything at or after the data cell of
    /// the oldest retained version stays, so every retained `Commit` record
    /// still finds its data. Returns the number of cells removed.
    pub fn truncate(&mut self, retain: usize) -> usize {
        let retain = retain.max(1);
        let commits: Vec<(Timestamp, Timestamp)> = self
            .cells
            .iter()
            .filter(|cell| cell.is_commit())
            .filter_map(|cell| cell.write.map(|write| (cell.ts, write.data_ts)))
            .collect();
        if commits.len() <= retain {
            return 0;
        }

        let (commit_ts, cutoff) = commits[commits.len() - retain];
        let before = self.cells.len();
        self.cells.retain(|cell| cell.ts >= cutoff || cell.is_locked());
        self.horizon = self.horizon.max(commit_ts);
        before - self.cells.len()
    }
}
