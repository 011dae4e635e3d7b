/// This module contains logic for detecting transaction conflicts.
pub mod detection;
/// This module contains logic for resolving transaction conflicts.
pub mod resolution;
