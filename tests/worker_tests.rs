//! Worker event loop tests against a hand-driven broker mailbox.


use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use jobhive::broker::Job;
use jobhive::endpoint::Endpoint;
use jobhive::rpc::local::LocalNetwork;
use jobhive::rpc::{Call, Envelope, Reply, Request, Rpc};
use jobhive::worker::{self, ExecutionUnit, WorkerRuntime};
use test_harness::{ep, BROKER};

const WAIT: Duration = Duration::from_secs(5);

/// Acknowledge calls until one with `method` arrives, returning it.
async fn expect_call(inbox: &mut mpsc::Receiver<Envelope>, method: &str) -> Request {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let envelope = tokio::time::timeout_at(deadline, inbox.recv())
            .await
            .unwrap_or_else(|_| panic!("no {method} call within {WAIT:?}"))
            .expect("broker mailbox closed");
        let request = envelope.request.clone();
        envelope.reply(Reply::Ack);
        if request.call.method() == method {
            return request;
        }
    }
}

struct Harness {
    net: LocalNetwork,
    broker_inbox: mpsc::Receiver<Envelope>,
    worker: Endpoint,
    runtime: WorkerRuntime<LocalNetwork>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn start_worker<F>(work: F) -> Harness
where
    F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
{
    let net = LocalNetwork::new();
    let broker_inbox = net.bind(ep(BROKER));
    let worker = ep("w1");
    let inbound = net.bind(worker.clone());

    let (unit, results) = ExecutionUnit::from_fn(work);
    let runtime = WorkerRuntime::new(
        worker.clone(),
        ep(BROKER),
        net.clone(),
        unit,
        Duration::from_millis(30),
        Duration::from_millis(200),
    );
    let shutdown = CancellationToken::new();
    let task = worker::spawn(runtime.clone(), results, inbound, shutdown.clone());

    Harness {
        net,
        broker_inbox,
        worker,
        runtime,
        shutdown,
        task,
    }
}

impl Harness {
    async fn offer(&self, payload: &str) -> Reply {
        self.net
            .call(
                &self.worker,
                Request::new(ep(BROKER), Call::Assign { job: Job::new(payload) }),
                Duration::from_secs(1),
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_worker_registers_immediately() {
    let mut h = start_worker(|p| p);

    let request = expect_call(&mut h.broker_inbox, "remind").await;
    assert_eq!(request.from, h.worker);

    h.shutdown.cancel();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_worker_keeps_sending_heartbeats() {
    let mut h = start_worker(|p| p);

    for _ in 0..3 {
        expect_call(&mut h.broker_inbox, "remind").await;
    }

    h.shutdown.cancel();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_assignment_produces_done() {
    let mut h = start_worker(|p| [b"out:".to_vec(), p].concat());

    assert_eq!(h.offer("task-1").await, Reply::Ack);
    let request = expect_call(&mut h.broker_inbox, "done").await;

    assert_eq!(request.from, h.worker);
    assert_eq!(
        request.call,
        Call::Done {
            job: Some(b"task-1".to_vec()),
            result: b"out:task-1".to_vec(),
        }
    );
    assert!(h.runtime.get_assigned().await.is_none());

    h.shutdown.cancel();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_busy_worker_rejects_second_assignment() {
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    let mut h = start_worker(move |p| {
        let _ = release_rx.lock().unwrap().recv();
        p
    });

    assert_eq!(h.offer("first").await, Reply::Ack);
    assert!(matches!(h.offer("second").await, Reply::Rejected { .. }));
    assert_eq!(h.runtime.get_assigned().await.unwrap().key(), b"first");

    release_tx.send(()).unwrap();
    let request = expect_call(&mut h.broker_inbox, "done").await;
    assert!(matches!(request.call, Call::Done { job: Some(ref key), .. } if key == b"first"));

    h.shutdown.cancel();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_sends_leaving() {
    let mut h = start_worker(|p| p);
    expect_call(&mut h.broker_inbox, "remind").await;

    h.shutdown.cancel();
    let request = expect_call(&mut h.broker_inbox, "leaving").await;
    assert_eq!(request.from, h.worker);
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_dead_execution_unit_stops_worker() {
    let mut h = start_worker(|_| panic!("work function crashed"));

    assert_eq!(h.offer("doomed").await, Reply::Ack);

    // The worker leaves on its own, without the shutdown token
    expect_call(&mut h.broker_inbox, "leaving").await;
    tokio::time::timeout(WAIT, h.task)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(!h.shutdown.is_cancelled());
}

#[tokio::test]
async fn test_unreachable_broker_does_not_stop_worker() {
    let mut h = start_worker(|p| p);
    h.net.inject(ep(BROKER), jobhive::rpc::local::Fault::Unreachable);

    // Work still runs; the completion is held back until the broker returns
    assert_eq!(h.offer("offline").await, Reply::Ack);
    test_harness::assert_eventually(
        || {
            let runtime = &h.runtime;
            async move { runtime.unreported_len().await == 1 }
        },
        WAIT,
        "completion was not stashed",
    )
    .await;

    h.net.heal(&ep(BROKER));
    let request = expect_call(&mut h.broker_inbox, "done").await;
    assert!(matches!(request.call, Call::Done { job: Some(ref key), .. } if key == b"offline"));

    h.shutdown.cancel();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_refused_done_is_dropped_and_worker_leaves() {
    use test_harness::{Behavior, ScriptedRpc};

    let rpc = ScriptedRpc::new();
    rpc.set(&ep(BROKER), Behavior::Refuse { method: "done" });
    let (unit, results) = ExecutionUnit::from_fn(|_| vec![0u8; 4096]);
    let runtime = WorkerRuntime::new(
        ep("w1"),
        ep(BROKER),
        rpc.clone(),
        unit,
        Duration::from_millis(30),
        Duration::from_millis(200),
    );
    let _listener = runtime.spawn_completion_listener(results, CancellationToken::new());

    runtime.assign(Job::new("too big to report")).await.unwrap();
    test_harness::assert_eventually(
        || {
            let rpc = &rpc;
            async move {
                rpc.calls()
                    .iter()
                    .any(|(_, request)| request.call == Call::Leaving)
            }
        },
        WAIT,
        "worker never left after its completion was refused",
    )
    .await;

    let methods: Vec<_> = rpc
        .calls()
        .into_iter()
        .map(|(_, request)| request.call.method())
        .collect();
    assert_eq!(methods, vec!["done", "leaving"]);

    // Nothing is kept for retry, and the next heartbeat re-registers an idle worker
    assert_eq!(runtime.unreported_len().await, 0);
    assert!(runtime.get_assigned().await.is_none());
    rpc.clear();
    runtime.heartbeat().await;
    let methods: Vec<_> = rpc
        .calls()
        .into_iter()
        .map(|(_, request)| request.call.method())
        .collect();
    assert_eq!(methods, vec!["remind"]);

    runtime.assign(Job::new("next")).await.unwrap();
    runtime.exit().await;
}
