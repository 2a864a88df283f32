//! Worker side of the pool.
//!
//! A worker wraps one execution unit, holds at most one job at a time and
//! keeps itself registered with its broker through heartbeats.
//!
//! # Components
//!
//! - [`WorkerRuntime`]: held-job slot, `assign`, completion reporting, `exit`
//! - [`executor::ExecutionUnit`]: the private channel to the work program
//! - [`heartbeat::HeartbeatSender`]: periodic `remind`
//!
//! # Tasks
//!
//! [`run`] splits a worker across three tasks so an inbound `assign` never
//! waits on an outbound call to the broker, which may itself be busy calling
//! this worker:
//!
//! 1. the inbound loop answers `assign`
//! 2. the heartbeat task calls `remind` (and retries unreported `done`s)
//! 3. the completion listener turns results into `done` calls

pub mod executor;
pub mod heartbeat;
pub mod runtime;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rpc::{Envelope, Reply, Rpc};
use crate::timer;

pub use executor::ExecutionUnit;
pub use heartbeat::HeartbeatSender;
pub use runtime::WorkerRuntime;

/// Start a worker on its own task.
pub fn spawn<R: Rpc>(
    runtime: WorkerRuntime<R>,
    results: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(runtime, results, inbound, shutdown))
}

/// Worker event loop. Returns after `shutdown` is cancelled, the execution
/// unit dies or the inbound mailbox closes, having left the broker.
pub async fn run<R: Rpc>(
    runtime: WorkerRuntime<R>,
    results: mpsc::Receiver<Vec<u8>>,
    mut inbound: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    let stopped = shutdown.child_token();
    let listener = runtime.spawn_completion_listener(results, stopped.clone());

    // First beat goes out immediately so the broker learns about us
    let heartbeat = {
        let runtime = runtime.clone();
        timer::spawn_periodic(Duration::ZERO, stopped.clone(), move || {
            let runtime = runtime.clone();
            async move { runtime.heartbeat().await }
        })
    };

    tracing::info!(worker = %runtime.identity(), broker = %runtime.broker(), "Worker started");

    loop {
        tokio::select! {
            biased;

            _ = stopped.cancelled() => break,

            envelope = inbound.recv() => {
                let Some(Envelope { request, reply_tx }) = envelope else {
                    break;
                };
                let reply = runtime.handle(request).await;
                let _ = reply_tx.send(reply);
            }
        }
    }

    stopped.cancel();
    inbound.close();
    while let Ok(envelope) = inbound.try_recv() {
        envelope.reply(Reply::rejected("worker is shutting down"));
    }

    if let Err(e) = heartbeat.await {
        tracing::warn!(worker = %runtime.identity(), error = %e, "Heartbeat task failed");
    }
    runtime.exit().await;
    listener.abort();

    tracing::info!(worker = %runtime.identity(), "Worker stopped");
}
