use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use jobhive::broker::{self, Broker, BrokerHandle};
use jobhive::dashboard::{router, DashboardState};
use jobhive::rpc::local::LocalNetwork;
use jobhive::rpc::{Call, Envelope, Request as RpcRequest, MAILBOX_CAPACITY};

use test_harness::{ep, test_broker_config, BROKER};

struct TestApp {
    app: Router,
    handle: BrokerHandle,
    inbound: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
}

fn create_test_app() -> TestApp {
    let (inbound_tx, inbound_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let broker = Broker::new(ep(BROKER), test_broker_config(), LocalNetwork::new());
    let shutdown = CancellationToken::new();
    let (handle, _task) = broker::actor::spawn(broker, inbound_rx, shutdown.clone());

    let app = router(DashboardState {
        broker: handle.clone(),
        inbound: inbound_tx.clone(),
    });
    TestApp {
        app,
        handle,
        inbound: inbound_tx,
        shutdown,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_status_empty_broker() {
    let t = create_test_app();

    let (status, json) = send(&t.app, get("/api/status")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json,
        json!({"workers": 0, "pending": 0, "jobs": 0, "assigned": 0, "completed": 0})
    );
    t.shutdown.cancel();
}

#[tokio::test]
async fn test_submit_job() {
    let t = create_test_app();

    let (status, json) = send(&t.app, post_json("/api/jobs", json!({"payload": "hello"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"accepted": true}));

    let metrics = t.handle.metrics().await.unwrap();
    assert_eq!(metrics.pending, 1);
    assert_eq!(metrics.jobs, 1);
    t.shutdown.cancel();
}

#[tokio::test]
async fn test_submit_is_idempotent() {
    let t = create_test_app();

    for _ in 0..3 {
        let (status, _) = send(&t.app, post_json("/api/jobs", json!({"payload": "once"}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(t.handle.metrics().await.unwrap().jobs, 1);
    t.shutdown.cancel();
}

#[tokio::test]
async fn test_submit_empty_payload_rejected() {
    let t = create_test_app();

    let (status, json) = send(&t.app, post_json("/api/jobs", json!({"payload": ""}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["accepted"], false);
    assert!(json["error"].is_string());
    t.shutdown.cancel();
}

#[tokio::test]
async fn test_submit_malformed_body_rejected() {
    let t = create_test_app();

    let (status, _) = send(&t.app, post_json("/api/jobs", json!({"command": "echo"}))).await;

    assert!(status.is_client_error());
    assert_eq!(t.handle.metrics().await.unwrap().jobs, 0);
    t.shutdown.cancel();
}

#[tokio::test]
async fn test_list_jobs_shows_pending_and_assignments() {
    let t = create_test_app();

    for payload in ["first", "second"] {
        send(&t.app, post_json("/api/jobs", json!({ "payload": payload }))).await;
    }

    let (status, json) = send(&t.app, get("/api/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["pending"], json!(["first", "second"]));
    assert_eq!(json["assignments"], json!([]));
    t.shutdown.cancel();
}

#[tokio::test]
async fn test_status_counts_registered_workers() {
    let t = create_test_app();

    // Register a worker through the mailbox the way a heartbeat would
    let (envelope, reply_rx) = Envelope::new(RpcRequest::new(ep("w1"), Call::Remind));
    t.inbound.send(envelope).await.unwrap();
    reply_rx.await.unwrap();

    let (_, json) = send(&t.app, get("/api/status")).await;
    assert_eq!(json["workers"], 1);
    t.shutdown.cancel();
}

#[tokio::test]
async fn test_stopped_broker_is_unavailable() {
    let t = create_test_app();
    t.handle.exit().await;

    // Give the actor a moment to drain its command channel
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (status, _) = send(&t.app, get("/api/status")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, json) = send(&t.app, post_json("/api/jobs", json!({"payload": "late"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["accepted"], false);
}
