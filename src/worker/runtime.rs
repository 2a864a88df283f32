use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::job::{preview, Job, Payload};
use crate::endpoint::Endpoint;
use crate::error::{HiveError, Result};
use crate::rpc::{Call, Reply, Request, Rpc};
use crate::worker::executor::ExecutionUnit;
use crate::worker::heartbeat::HeartbeatSender;

/// A finished job whose `done` the broker has not acknowledged yet
#[derive(Debug, Clone)]
struct Unreported {
    job: Payload,
    result: Vec<u8>,
}

/// State shared by a worker's inbound loop, heartbeat task and completion
/// listener.
///
/// Cloning is cheap; every clone refers to the same held-job slot and the
/// same execution unit.
#[derive(Clone)]
pub struct WorkerRuntime<R> {
    identity: Endpoint,
    broker: Endpoint,
    rpc: R,
    rpc_timeout: Duration,
    heartbeat: HeartbeatSender<R>,
    held: Arc<Mutex<Option<Job>>>,
    unit: Arc<Mutex<Option<ExecutionUnit>>>,
    unreported: Arc<Mutex<VecDeque<Unreported>>>,
}

impl<R: Rpc> WorkerRuntime<R> {
    pub fn new(
        identity: Endpoint,
        broker: Endpoint,
        rpc: R,
        unit: ExecutionUnit,
        heartbeat_interval: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        let heartbeat = HeartbeatSender::new(
            rpc.clone(),
            identity.clone(),
            broker.clone(),
            heartbeat_interval,
            rpc_timeout,
        );
        Self {
            identity,
            broker,
            rpc,
            rpc_timeout,
            heartbeat,
            held: Arc::new(Mutex::new(None)),
            unit: Arc::new(Mutex::new(Some(unit))),
            unreported: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn identity(&self) -> &Endpoint {
        &self.identity
    }

    pub fn broker(&self) -> &Endpoint {
        &self.broker
    }

    pub async fn get_assigned(&self) -> Option<Job> {
        self.held.lock().await.clone()
    }

    /// Completions still waiting to reach the broker.
    pub async fn unreported_len(&self) -> usize {
        self.unreported.lock().await.len()
    }

    /// Hand `job` to the execution unit and hold it until its result arrives.
    pub async fn assign(&self, job: Job) -> Result<()> {
        // Held across the send so the listener cannot clear a job not yet recorded
        let mut held = self.held.lock().await;
        if let Some(current) = held.as_ref() {
            tracing::warn!(worker = %self.identity, held = %current, offered = %job, "Already holding a job");
            return Err(HiveError::AlreadyAssigned);
        }

        let unit = self.unit.lock().await;
        let Some(unit) = unit.as_ref() else {
            return Err(HiveError::Execution("execution unit stopped".to_string()));
        };
        unit.send(job.payload.clone()).await?;

        tracing::info!(worker = %self.identity, job = %job, "Job accepted");
        *held = Some(job);
        Ok(())
    }

    /// Report any stashed completions, then send `remind`. Returns the
    /// heartbeat interval.
    pub async fn heartbeat(&self) -> Duration {
        self.flush_unreported().await;
        self.heartbeat.beat().await
    }

    /// Answer one inbound call. Workers serve only `assign`.
    pub async fn handle(&self, request: Request) -> Reply {
        let Request { from, call } = request;
        match call {
            Call::Assign { job } => match self.assign(job).await {
                Ok(()) => Reply::Ack,
                Err(e) => {
                    tracing::debug!(worker = %self.identity, from = %from, error = %e, "Refusing assignment");
                    Reply::rejected(e.to_string())
                }
            },
            other => {
                tracing::warn!(worker = %self.identity, from = %from, method = other.method(), "Unsupported call");
                Reply::rejected(format!("workers do not serve {}", other.method()))
            }
        }
    }

    /// Forward each result from the execution unit to the broker.
    ///
    /// When the unit's output closes the listener cancels `stopped`, since a
    /// worker without an execution unit cannot do anything useful.
    pub fn spawn_completion_listener(
        &self,
        mut results: mpsc::Receiver<Vec<u8>>,
        stopped: CancellationToken,
    ) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                runtime.complete(result).await;
            }
            tracing::warn!(worker = %runtime.identity, "Execution unit closed its output");
            stopped.cancel();
        })
    }

    /// Leave the broker, then stop the execution unit.
    pub async fn exit(&self) {
        self.flush_unreported().await;

        match self.leave().await {
            Ok(()) => tracing::info!(worker = %self.identity, broker = %self.broker, "Left broker"),
            Err(e) => tracing::warn!(
                worker = %self.identity,
                broker = %self.broker,
                error = %e,
                "Failed to notify broker of departure"
            ),
        }

        if let Some(unit) = self.unit.lock().await.take() {
            unit.terminate().await;
        }
        if let Some(job) = self.held.lock().await.take() {
            tracing::info!(worker = %self.identity, job = %job, "Abandoned held job on exit");
        }
    }

    async fn complete(&self, result: Vec<u8>) {
        let Some(job) = self.held.lock().await.take() else {
            tracing::warn!(worker = %self.identity, "Result arrived with no job held, dropping");
            return;
        };
        tracing::info!(worker = %self.identity, job = %job, result_bytes = result.len(), "Job finished");

        let report = Unreported {
            job: job.payload,
            result,
        };
        match self.report(&report).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(worker = %self.identity, error = %e, "Failed to report completion, will retry");
                self.unreported.lock().await.push_back(report);
            }
            Err(e) => self.give_up(&report, e).await,
        }
    }

    async fn flush_unreported(&self) {
        let mut unreported = self.unreported.lock().await;
        while let Some(report) = unreported.front() {
            match self.report(report).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(worker = %self.identity, error = %e, "Completion still undeliverable");
                    return;
                }
                Err(e) => self.give_up(report, e).await,
            }
            unreported.pop_front();
        }
    }

    /// Drop a completion the broker will never accept and leave, so the
    /// broker requeues the job instead of waiting on this worker forever.
    /// The next heartbeat registers the worker again as idle.
    async fn give_up(&self, report: &Unreported, error: HiveError) {
        tracing::error!(
            worker = %self.identity,
            job = %preview(&report.job),
            result_bytes = report.result.len(),
            error = %error,
            "Broker refused completion, dropping it and leaving"
        );
        if let Err(e) = self.leave().await {
            tracing::warn!(worker = %self.identity, broker = %self.broker, error = %e, "Failed to leave after refused completion");
        }
    }

    async fn leave(&self) -> Result<()> {
        let request = Request::new(self.identity.clone(), Call::Leaving);
        self.rpc.call_ack(&self.broker, request, self.rpc_timeout).await
    }

    async fn report(&self, report: &Unreported) -> Result<()> {
        let request = Request::new(
            self.identity.clone(),
            Call::Done {
                job: Some(report.job.clone()),
                result: report.result.clone(),
            },
        );
        self.rpc.call_ack(&self.broker, request, self.rpc_timeout).await
    }
}
