//! Serving transaction requests in the challenge wire format.
//!
//! A request body is `{"type":"txn","msg_id":1,"txn":[["r",1,null],["w",2,3]]}`.
//! The reply is `{"type":"txn_ok","in_reply_to":1,"txn":[["r",1,5],["w",2,3]]}`
//! on success, or an `error` body carrying one of the codes below.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{PercolatorError, Result};
use crate::operation::{CompletedOp, Operation};
use crate::coordinator::Percolator;

/// The operation could not be served right now; the client may retry.
pub const TEMPORARILY_UNAVAILABLE: u32 = 11;
/// The request is not a well formed transaction.
pub const MALFORMED_REQUEST: u32 = 12;
/// The node can no longer vouch for its own state.
pub const CRASH: u32 = 13;
/// The transaction was aborted because of a conflict.
pub const TXN_CONFLICT: u32 = 30;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    msg_id: Option<u64>,
    #[serde(default)]
    txn: serde_json::Value,
}

/// Reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    TxnOk {
        #[serde(skip_serializing_if = "Option::is_none")]
        in_reply_to: Option<u64>,
        txn: Vec<CompletedOp>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        in_reply_to: Option<u64>,
        code: u32,
        text: String,
    },
}

impl Reply {
    pub fn error(in_reply_to: Option<u64>, err: &PercolatorError) -> Self {
        Reply::Error {
            in_reply_to,
            code: error_code(err),
            text: err.to_string(),
        }
    }

    pub fn in_reply_to(&self) -> Option<u64> {
        match self {
            Reply::TxnOk { in_reply_to, .. } | Reply::Error { in_reply_to, .. } => *in_reply_to,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| PercolatorError::CodecError(e.to_string()))
    }
}

/// Wire error code for `err`.
pub fn error_code(err: &PercolatorError) -> u32 {
    match err {
        PercolatorError::TransactionConflict { .. } => TXN_CONFLICT,
        PercolatorError::Contention { .. }
        | PercolatorError::LockWaitTimeout { .. }
        | PercolatorError::SnapshotTooOld { .. }
        | PercolatorError::StorageError(_)
        | PercolatorError::OracleUnavailable(_)
        | PercolatorError::Shutdown
        | PercolatorError::RetriesExhausted { .. } => TEMPORARILY_UNAVAILABLE,
        PercolatorError::MalformedOperation(_) => MALFORMED_REQUEST,
        PercolatorError::CodecError(_)
        | PercolatorError::ConfigError(_)
        | PercolatorError::InvariantViolation(_) => CRASH,
    }
}

/// Decodes one request body, runs it on `engine` and builds the reply.
pub fn handle(engine: &Percolator, body: &str) -> Reply {
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => return Reply::error(None, &PercolatorError::MalformedOperation(e.to_string())),
    };
    let msg_id = envelope.msg_id;
    if envelope.kind != "txn" {
        let err = PercolatorError::MalformedOperation(format!(
            "unsupported message type {:?}",
            envelope.kind
        ));
        return Reply::error(msg_id, &err);
    }
    let ops: Vec<Operation> = match serde_json::from_value(envelope.txn) {
        Ok(ops) => ops,
        Err(e) => {
            return Reply::error(msg_id, &PercolatorError::MalformedOperation(e.to_string()));
        }
    };

    match engine.execute(&ops) {
        Ok(txn) => Reply::TxnOk {
            in_reply_to: msg_id,
            txn,
        },
        Err(e) => {
            if e.is_fatal() {
                error!("Request {:?} failed fatally: {}", msg_id, e);
            } else {
                debug!("Request {:?} failed: {}", msg_id, e);
            }
            Reply::error(msg_id, &e)
        }
    }
}

type Job = (String, Sender<Reply>);

/// A fixed pool of worker threads serving requests against one coordinator.
///
/// Requests queue on a bounded channel and each one is handled on its own by
/// whichever worker picks it up. Replies travel back on a channel created per
/// request.
pub struct TxnServer {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TxnServer {
    /// Starts `workers` threads (at least one) behind a queue of `queue`
    /// pending requests.
    pub fn start(engine: Arc<Percolator>, workers: usize, queue: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(queue);
        let workers = (0..workers.max(1))
            .map(|id| {
                let engine = Arc::clone(&engine);
                let receiver = receiver.clone();
                thread::spawn(move || serve(id, &engine, receiver))
            })
            .collect::<Vec<_>>();
        info!("Transaction server started with {} workers", workers.len());
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queues a request body. The reply arrives on the returned channel.
    ///
    /// Blocks while the queue is full.
    pub fn submit(&self, body: impl Into<String>) -> Result<Receiver<Reply>> {
        let sender = self.sender.as_ref().ok_or(PercolatorError::Shutdown)?;
        let (reply_tx, reply_rx) = bounded(1);
        sender
            .send((body.into(), reply_tx))
            .map_err(|_| PercolatorError::Shutdown)?;
        Ok(reply_rx)
    }

    /// Queues a request body and waits for its reply.
    pub fn call(&self, body: impl Into<String>) -> Result<Reply> {
        self.submit(body)?
            .recv()
            .map_err(|_| PercolatorError::Shutdown)
    }

    /// Stops accepting requests, lets the workers drain the queue and joins
    /// them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Transaction worker panicked");
            }
        }
        info!("Transaction server stopped");
    }
}

impl Drop for TxnServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(id: usize, engine: &Percolator, jobs: Receiver<Job>) {
    for (body, reply) in jobs.iter() {
        let out = handle(engine, &body);
        if reply.send(out).is_err() {
            warn!("Worker {}: caller left before the reply", id);
        }
    }
    debug!("Worker {} exiting", id);
}
