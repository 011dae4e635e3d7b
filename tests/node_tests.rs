#![cfg(feature = "node")]

mod common;

use std::sync::Arc;
use std::thread;

use serde_json::{Value as Json, json};

use percolator::node::{
    CRASH, MALFORMED_REQUEST, TEMPORARILY_UNAVAILABLE, TXN_CONFLICT, error_code, handle,
};
use percolator::prelude::*;

use common::{fail_config, setup_percolator, test_config};

fn reply_json(reply: &Reply) -> Json {
    serde_json::from_str(&reply.to_json().unwrap()).unwrap()
}

#[test]
fn test_operations_decode_from_triples() {
    let ops = Operation::decode_txn(r#"[["r", 1, null], ["w", 2, 3], ["r", 4, 9]]"#).unwrap();
    assert_eq!(
        ops,
        vec![Operation::read(1), Operation::write(2, 3), Operation::read(4)]
    );
    assert_eq!(
        serde_json::to_value(&ops).unwrap(),
        json!([["r", 1, null], ["w", 2, 3], ["r", 4, null]])
    );
}

#[test]
fn test_malformed_operations_are_rejected() {
    for bad in [
        r#"[["w", 1, null]]"#,
        r#"[["x", 1, 2]]"#,
        r#"[["r", "one", null]]"#,
        r#"[["r", 1]]"#,
        r#"{"r": 1}"#,
    ] {
        let err = Operation::decode_txn(bad).unwrap_err();
        assert!(matches!(err, PercolatorError::MalformedOperation(_)), "{}", bad);
    }
}

#[test]
fn test_completed_ops_serialize_as_triples() {
    let done = vec![
        CompletedOp::Read { key: 1, value: None },
        CompletedOp::Read { key: 2, value: Some(5) },
        CompletedOp::Write { key: 3, value: 7 },
    ];
    let value = serde_json::to_value(&done).unwrap();
    assert_eq!(value, json!([["r", 1, null], ["r", 2, 5], ["w", 3, 7]]));
    let back: Vec<CompletedOp> = serde_json::from_value(value).unwrap();
    assert_eq!(back, done);
}

#[test]
fn test_handle_txn() {
    let percolator = setup_percolator(test_config());

    let reply = handle(
        &percolator,
        r#"{"type":"txn","msg_id":1,"txn":[["w",1,10],["r",1,null]]}"#,
    );
    assert_eq!(
        reply_json(&reply),
        json!({"type":"txn_ok","in_reply_to":1,"txn":[["w",1,10],["r",1,10]]})
    );

    let reply = handle(&percolator, r#"{"type":"txn","msg_id":2,"txn":[["r",1,null]]}"#);
    assert_eq!(
        reply,
        Reply::TxnOk {
            in_reply_to: Some(2),
            txn: vec![CompletedOp::Read { key: 1, value: Some(10) }],
        }
    );
}

#[test]
fn test_handle_rejects_bad_requests() {
    let percolator = setup_percolator(test_config());

    let cases = [
        (r#"{"type":"echo","msg_id":3}"#, Some(3)),
        (r#"{"type":"txn","msg_id":4,"txn":[["w",1]]}"#, Some(4)),
        (r#"{"type":"txn","msg_id":5}"#, Some(5)),
        ("not json", None),
    ];
    for (body, msg_id) in cases {
        match handle(&percolator, body) {
            Reply::Error {
                in_reply_to, code, ..
            } => {
                assert_eq!(code, MALFORMED_REQUEST, "{}", body);
                assert_eq!(in_reply_to, msg_id, "{}", body);
            }
            other => panic!("{} should be rejected, got {:?}", body, other),
        }
    }
}

#[test]
fn test_handle_reports_conflicts_under_fail_policy() {
    let percolator = setup_percolator(fail_config());
    let mut holder = percolator.start_transaction().unwrap();
    holder.write(1, 1).unwrap();

    let reply = handle(&percolator, r#"{"type":"txn","msg_id":7,"txn":[["w",1,2]]}"#);
    let body = reply_json(&reply);
    assert_eq!(body["type"], "error");
    assert_eq!(body["code"], TXN_CONFLICT);
    assert_eq!(body["in_reply_to"], 7);
    holder.rollback().unwrap();
}

#[test]
fn test_error_codes() {
    let conflict = PercolatorError::TransactionConflict {
        key: 1,
        conflict: ConflictType::NewerCommit { ts: 3 },
    };
    assert_eq!(error_code(&conflict), TXN_CONFLICT);
    assert_eq!(
        error_code(&PercolatorError::Contention { key: 1, attempts: 3 }),
        TEMPORARILY_UNAVAILABLE
    );
    assert_eq!(
        error_code(&PercolatorError::RetriesExhausted {
            attempts: 2,
            source: Box::new(conflict),
        }),
        TEMPORARILY_UNAVAILABLE
    );
    assert_eq!(
        error_code(&PercolatorError::StorageError("down".to_string())),
        TEMPORARILY_UNAVAILABLE
    );
    assert_eq!(
        error_code(&PercolatorError::MalformedOperation("bad".to_string())),
        MALFORMED_REQUEST
    );
    assert_eq!(
        error_code(&PercolatorError::InvariantViolation("lost lock".to_string())),
        CRASH
    );
}

#[test]
fn test_server_handles_concurrent_requests() {
    const CLIENTS: i64 = 8;
    let percolator = setup_percolator(test_config());
    let server = Arc::new(TxnServer::start(percolator.clone(), 4, 16));

    let handles: Vec<_> = (0..CLIENTS)
        .map(|i| {
            let server = server.clone();
            thread::spawn(move || {
                let body = json!({"type": "txn", "msg_id": i, "txn": [["w", i, i * 10], ["w", 100, i]]});
                server.call(body.to_string()).unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let reply = handle.join().expect("client panicked");
        assert_eq!(reply.in_reply_to(), Some(i as u64));
        assert!(matches!(reply, Reply::TxnOk { .. }), "{:?}", reply);
    }

    let reply = server
        .call(r#"{"type":"txn","msg_id":99,"txn":[["r",3,null],["r",100,null]]}"#)
        .unwrap();
    match reply {
        Reply::TxnOk { txn, .. } => {
            assert_eq!(txn[0], CompletedOp::Read { key: 3, value: Some(30) });
            let last = txn[1].read_value().flatten().unwrap();
            assert!((0..CLIENTS).contains(&last));
        }
        other => panic!("unexpected reply {:?}", other),
    }

    match Arc::try_unwrap(server) {
        Ok(server) => server.shutdown(),
        Err(_) => panic!("server still shared"),
    }
}

#[test]
fn test_submit_returns_reply_channel() {
    let percolator = setup_percolator(test_config());
    let server = TxnServer::start(percolator, 1, 1);

    let pending = server
        .submit(r#"{"type":"txn","msg_id":1,"txn":[["w",1,1]]}"#)
        .unwrap();
    let reply = pending.recv().unwrap();
    assert_eq!(reply.in_reply_to(), Some(1));
    drop(server);
}
