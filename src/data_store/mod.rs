/// Cells: the versioned records stored against a key.
pub mod cell;
/// Version chains and their encoding.
pub mod chain;
/// Read and compare-and-swap of whole chains against the remote store.
pub mod cell_store;
