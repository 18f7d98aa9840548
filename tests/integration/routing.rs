#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::test_supervisor;
use corral::{client::NodeClient, message::Message};
use serde_json::json;
use tempfile::tempdir;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

#[test]
fn unknown_destination_gets_error_reply_then_delivery_once_connected() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = test_supervisor(&temp.path().join("logs"));
    let addr = supervisor.serve().expect("serve");

    let master2 = NodeClient::connect(addr, "Master2").expect("connect Master2");
    supervisor
        .wait_for_service("Master2", RECV_TIMEOUT, Duration::from_millis(20))
        .expect("Master2 handshake");

    master2
        .send(Message::new("ping", "Worker", "Master2").with_mid("m1"))
        .expect("send ping");
    let reply = master2.recv_timeout(RECV_TIMEOUT).expect("error reply");
    assert_eq!(reply.topic, "error");
    assert_eq!(reply.to, "Master2");
    assert_eq!(reply.from, "master");
    assert_eq!(reply.data, json!({ "mid": "m1", "value": "unknown node Worker" }));
    assert!(master2.recv_timeout(Duration::from_millis(200)).is_none());

    let worker = NodeClient::connect(addr, "Worker").expect("connect Worker");
    supervisor
        .wait_for_service("Worker", RECV_TIMEOUT, Duration::from_millis(20))
        .expect("Worker handshake");

    let mid = master2
        .send_to("Worker", "rpc", json!({ "method": "health" }))
        .expect("send rpc");
    let delivered = worker.recv_timeout(RECV_TIMEOUT).expect("forwarded rpc");
    assert_eq!(delivered.topic, "rpc");
    assert_eq!(delivered.from, "Master2");
    assert_eq!(delivered.mid, mid);
    assert_eq!(delivered.data, json!({ "method": "health" }));

    worker
        .send(
            Message::new("rpc-reply", "Master2", "Worker")
                .with_mid(mid.clone())
                .with_data(json!({ "ok": true })),
        )
        .expect("send reply");
    let answer = master2.recv_timeout(RECV_TIMEOUT).expect("reply");
    assert_eq!(answer.mid, mid);
    assert_eq!(answer.data, json!({ "ok": true }));

    supervisor.shutdown(Duration::from_secs(1));
}

#[test]
fn disconnected_node_is_reported_unknown() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = test_supervisor(&temp.path().join("logs"));
    let addr = supervisor.serve().expect("serve");

    let sender = NodeClient::connect(addr, "Sender").expect("connect Sender");
    let worker = NodeClient::connect(addr, "Worker").expect("connect Worker");
    supervisor
        .wait_for_service("Worker", RECV_TIMEOUT, Duration::from_millis(20))
        .expect("Worker handshake");
    supervisor
        .wait_for_service("Sender", RECV_TIMEOUT, Duration::from_millis(20))
        .expect("Sender handshake");

    worker.close();
    common::wait_for(RECV_TIMEOUT, "worker disconnect", || {
        !supervisor.registry().is_connected("Worker")
    });
    assert!(supervisor.registry().get("Worker").is_some());

    sender
        .send(Message::new("ping", "Worker", "Sender").with_mid("late"))
        .expect("send ping");
    let reply = sender.recv_timeout(RECV_TIMEOUT).expect("error reply");
    assert_eq!(reply.topic, "error");
    assert_eq!(reply.data["mid"], "late");
    assert_eq!(reply.data["value"], "unknown node Worker");

    supervisor.shutdown(Duration::from_secs(1));
}
