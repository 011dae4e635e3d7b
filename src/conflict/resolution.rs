use serde::{Deserialize, Serialize};

/// Defines what the coordinator does when an attempt hits a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Roll the attempt back and run the whole transaction again with fresh
    /// timestamps. Conflicts are only visible to the caller as latency.
    #[default]
    Retry,
    /// Roll the attempt back and report the conflict to the caller, who is
    /// expected to resubmit the same transaction.
    Fail,
}
