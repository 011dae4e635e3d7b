//! Operations of a transaction request and their results.
//!
//! On the wire both are `[op, key, value]` triples: `["r", 1, null]` reads key
//! 1, `["w", 1, 10]` writes 10 to it. A completed read carries the resolved
//! value, or `null` when the key has none.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::errors::{PercolatorError, Result};
use crate::{Key, Value};

const READ: &str = "r";
const WRITE: &str = "w";

/// One step of a transaction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read { key: Key },
    Write { key: Key, value: Value },
}

impl Operation {
    pub fn read(key: Key) -> Self {
        Operation::Read { key }
    }

    pub fn write(key: Key, value: Value) -> Self {
        Operation::Write { key, value }
    }

    pub fn key(&self) -> Key {
        match *self {
            Operation::Read { key } | Operation::Write { key, .. } => key,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Operation::Write { .. })
    }

    /// Decodes a JSON array of operation triples.
    pub fn decode_txn(json: &str) -> Result<Vec<Operation>> {
        serde_json::from_str(json).map_err(|e| PercolatorError::MalformedOperation(e.to_string()))
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            Operation::Read { key } => (READ, key, None::<Value>).serialize(serializer),
            Operation::Write { key, value } => (WRITE, key, Some(value)).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (op, key, value) = <(String, Key, Option<Value>)>::deserialize(deserializer)?;
        match (op.as_str(), value) {
            // A value sent along with a read is ignored.
            (READ, _) => Ok(Operation::Read { key }),
            (WRITE, Some(value)) => Ok(Operation::Write { key, value }),
            (WRITE, None) => Err(de::Error::custom(format!(
                "write to key {} without a value",
                key
            ))),
            (other, _) => Err(de::Error::custom(format!("unknown operation {:?}", other))),
        }
    }
}

/// Result of one [`Operation`], in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletedOp {
    /// The value visible to the transaction, `None` if the key has none.
    Read { key: Key, value: Option<Value> },
    /// Echo of the written value.
    Write { key: Key, value: Value },
}

impl CompletedOp {
    pub fn key(&self) -> Key {
        match *self {
            CompletedOp::Read { key, .. } | CompletedOp::Write { key, .. } => key,
        }
    }

    /// The value read, for reads.
    pub fn read_value(&self) -> Option<Option<Value>> {
        match *self {
            CompletedOp::Read { value, .. } => Some(value),
            CompletedOp::Write { .. } => None,
        }
    }
}

impl Serialize for CompletedOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            CompletedOp::Read { key, value } => (READ, key, value).serialize(serializer),
            CompletedOp::Write { key, value } => (WRITE, key, Some(value)).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CompletedOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (op, key, value) = <(String, Key, Option<Value>)>::deserialize(deserializer)?;
        match (op.as_str(), value) {
            (READ, value) => Ok(CompletedOp::Read { key, value }),
            (WRITE, Some(value)) => Ok(CompletedOp::Write { key, value }),
            (WRITE, None) => Err(de::Error::custom(format!(
                "write to key {} without a value",
                key
            ))),
            (other, _) => Err(de::Error::custom(format!("unknown operation {:?}", other))),
        }
    }
}
