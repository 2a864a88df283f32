//! The central coordinator.
//!
//! [`Broker`] owns the job registry, the pending queue, the worker registry
//! and the assignment map. Every operation runs to completion before the
//! next one starts; [`actor`] enforces that by feeding operations from a
//! single mailbox.
//!
//! # Lifecycle
//!
//! 1. `assign` tracks a new payload at the tail of the queue
//! 2. the assignment pass hands pending jobs to free workers
//! 3. `done` from the holder retires the job
//! 4. `leaving` or a `gc` expiry resigns a held job to the queue front

pub mod actor;
pub mod assigner;
pub mod job;
pub mod queue;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::BrokerConfig;
use crate::endpoint::Endpoint;
use crate::rpc::{Call, Reply, Request, Rpc};

pub use actor::{BrokerCommand, BrokerHandle};
pub use assigner::WorkerRegistry;
pub use job::{preview, Job, Payload};
pub use queue::JobQueue;

const COMPLETION_FEED_CAPACITY: usize = 1024;

/// Counts reported by the periodic metrics tick and the status endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMetrics {
    pub workers: usize,
    pub pending: usize,
    pub jobs: usize,
    pub assigned: usize,
    pub completed: u64,
}

/// Point-in-time view of broker state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub metrics: BrokerMetrics,
    pub workers: Vec<Endpoint>,
    /// Pending payloads in dispatch order
    pub pending: Vec<Payload>,
    pub assignments: BTreeMap<Endpoint, Payload>,
}

/// A job retired by its holder's `done`
#[derive(Debug, Clone)]
pub struct Completion {
    pub job: Job,
    pub worker: Endpoint,
    pub result: Vec<u8>,
}

pub struct Broker<R> {
    endpoint: Endpoint,
    config: BrokerConfig,
    rpc: R,
    queue: JobQueue,
    registry: WorkerRegistry,
    completions: broadcast::Sender<Completion>,
    completed: u64,
    exited: bool,
}

impl<R: Rpc> Broker<R> {
    pub fn new(endpoint: Endpoint, config: BrokerConfig, rpc: R) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_FEED_CAPACITY);
        Self {
            endpoint,
            registry: WorkerRegistry::new(config.max_pings),
            config,
            rpc,
            queue: JobQueue::new(),
            completions,
            completed: 0,
            exited: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.completions.subscribe()
    }

    pub(crate) fn completion_feed(&self) -> broadcast::Sender<Completion> {
        self.completions.clone()
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }

    /// Track a new job and try to dispatch it. Returns false if the payload
    /// is already tracked.
    pub async fn assign(&mut self, job: Job) -> bool {
        if self.exited {
            return false;
        }
        let label = job.to_string();
        if !self.queue.submit(job) {
            tracing::warn!(job = %label, "Job already tracked, ignoring duplicate submission");
            return false;
        }
        tracing::info!(job = %label, pending = self.queue.pending_len(), "Job queued");
        self.assignment_pass().await;
        true
    }

    /// Retire the job held by `sender`. Returns true if a job was retired.
    ///
    /// `reported` is the payload key the worker says it finished; when given
    /// it must match the job the broker believes the worker holds.
    pub async fn done(&mut self, sender: &Endpoint, reported: Option<&[u8]>, result: Vec<u8>) -> bool {
        if self.exited {
            return false;
        }
        if !self.registry.is_registered(sender) {
            tracing::warn!(worker = %sender, "Completion from unregistered worker, ignoring");
            return false;
        }
        let Some(held) = self.registry.assignment_of(sender) else {
            tracing::warn!(worker = %sender, "Completion from worker holding no job, ignoring");
            return false;
        };
        if let Some(reported) = reported {
            if reported != held.as_slice() {
                tracing::warn!(
                    worker = %sender,
                    reported = %preview(reported),
                    held = %preview(held),
                    "Completion for a job the worker no longer holds, ignoring"
                );
                return false;
            }
        }

        let Some(key) = self.registry.release(sender) else {
            return false;
        };
        let Some(job) = self.queue.retire(&key) else {
            tracing::warn!(worker = %sender, job = %preview(&key), "Assigned job was not tracked");
            self.assignment_pass().await;
            return false;
        };

        self.completed += 1;
        tracing::info!(worker = %sender, job = %job, result_bytes = result.len(), "Job done");
        // No subscribers is fine
        let _ = self.completions.send(Completion {
            job,
            worker: sender.clone(),
            result,
        });

        self.assignment_pass().await;
        true
    }

    /// Graceful departure. Returns false for an unknown worker.
    pub async fn leaving(&mut self, sender: &Endpoint) -> bool {
        if self.exited {
            return false;
        }
        if !self.resign(sender) {
            tracing::warn!(worker = %sender, "Departure from unregistered worker, ignoring");
            return false;
        }
        tracing::info!(worker = %sender, "Worker left");
        self.assignment_pass().await;
        true
    }

    /// Heartbeat receipt. Returns true when the worker was newly registered.
    pub async fn remind(&mut self, sender: &Endpoint) -> bool {
        if self.exited {
            return false;
        }
        if self.registry.heartbeat(sender) {
            tracing::info!(worker = %sender, workers = self.registry.worker_count(), "Worker registered");
            self.assignment_pass().await;
            true
        } else {
            tracing::debug!(worker = %sender, "Heartbeat");
            false
        }
    }

    /// Liveness sweep. Returns the delay until the next sweep.
    pub async fn gc(&mut self) -> Duration {
        if self.exited {
            return self.config.heartbeat_interval();
        }
        let expired = self.registry.decrement_all();
        for worker in &expired {
            tracing::warn!(worker = %worker, "Worker missed heartbeats, expiring");
            self.resign(worker);
        }
        self.assignment_pass().await;
        self.config.heartbeat_interval()
    }

    /// Log current counts. Returns the delay until the next report.
    pub fn metrics(&self) -> Duration {
        let m = self.snapshot_metrics();
        tracing::info!(
            workers = m.workers,
            pending = m.pending,
            jobs = m.jobs,
            assigned = m.assigned,
            completed = m.completed,
            "Broker metrics"
        );
        self.config.metrics_interval()
    }

    pub fn exit(&mut self) {
        if !self.exited {
            tracing::info!(endpoint = %self.endpoint, "Broker exiting");
            self.exited = true;
        }
    }

    /// Dispatch one inbound request to the matching operation.
    pub async fn handle(&mut self, request: Request) -> Reply {
        if self.exited {
            return Reply::rejected("broker is shutting down");
        }
        let Request { from, call } = request;
        match call {
            Call::Assign { job } => {
                self.assign(job).await;
            }
            Call::Done { job, result } => {
                self.done(&from, job.as_deref(), result).await;
            }
            Call::Leaving => {
                self.leaving(&from).await;
            }
            Call::Remind => {
                self.remind(&from).await;
            }
        }
        Reply::Ack
    }

    pub fn snapshot_metrics(&self) -> BrokerMetrics {
        BrokerMetrics {
            workers: self.registry.worker_count(),
            pending: self.queue.pending_len(),
            jobs: self.queue.len(),
            assigned: self.registry.assigned_count(),
            completed: self.completed,
        }
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        let mut workers: Vec<Endpoint> = self
            .registry
            .all_workers()
            .into_iter()
            .map(|w| w.endpoint.clone())
            .collect();
        workers.sort();

        BrokerSnapshot {
            metrics: self.snapshot_metrics(),
            workers,
            pending: self
                .queue
                .pending()
                .into_iter()
                .map(|j| j.payload.clone())
                .collect(),
            assignments: self
                .registry
                .assignments()
                .map(|(w, k)| (w.clone(), k.clone()))
                .collect(),
        }
    }

    /// Check the bookkeeping invariants, describing the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for job in self.queue.pending() {
            if !seen.insert(job.payload.clone()) {
                return Err(format!("job {job} is pending twice"));
            }
            if let Some(holder) = self.registry.holder_of(job.key()) {
                return Err(format!("job {job} is pending and held by {holder}"));
            }
        }
        if seen.len() != self.queue.pending_len() {
            return Err("pending queue holds untracked keys".to_string());
        }

        for (worker, key) in self.registry.assignments() {
            if !self.registry.is_registered(worker) {
                return Err(format!("unregistered worker {worker} holds a job"));
            }
            if !self.queue.contains(key) {
                return Err(format!("{worker} holds untracked job {}", preview(key)));
            }
            if self.registry.holder_of(key) != Some(worker) {
                return Err(format!("holder map disagrees for {}", preview(key)));
            }
        }

        let accounted = self.queue.pending_len() + self.registry.assigned_count();
        if accounted != self.queue.len() {
            return Err(format!(
                "{} tracked jobs but {} pending + {} assigned",
                self.queue.len(),
                self.queue.pending_len(),
                self.registry.assigned_count()
            ));
        }
        Ok(())
    }

    /// Remove a worker, putting any job it held back at the queue front.
    fn resign(&mut self, worker: &Endpoint) -> bool {
        match self.registry.remove(worker) {
            None => false,
            Some(None) => true,
            Some(Some(key)) => {
                tracing::info!(worker = %worker, job = %preview(&key), "Job resigned to front of queue");
                self.queue.push_front(key);
                true
            }
        }
    }

    /// Match free workers with pending jobs until one side runs out.
    async fn assignment_pass(&mut self) {
        let mut free = self.registry.free_workers();
        let timeout = self.config.rpc_timeout();

        while !free.is_empty() {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            let worker = free.swap_remove(rand::thread_rng().gen_range(0..free.len()));

            let request = Request::new(self.endpoint.clone(), Call::Assign { job: job.clone() });
            match self.rpc.call_ack(&worker, request, timeout).await {
                Ok(()) => {
                    if self.registry.assign(&worker, job.payload.clone()) {
                        tracing::info!(worker = %worker, job = %job, "Job assigned");
                    } else {
                        tracing::warn!(worker = %worker, job = %job, "Worker vanished during assignment, requeueing");
                        self.queue.push_front(job.payload);
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %worker, job = %job, error = %e, "Assignment failed, requeueing");
                    self.queue.push_front(job.payload);
                }
            }
        }
    }
}
