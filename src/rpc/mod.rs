//! Request/response plumbing between broker and workers.
//!
//! Every peer owns a mailbox of [`Envelope`]s. A transport delivers a
//! [`Request`] into the callee's mailbox and hands the callee's [`Reply`]
//! back to the caller, or fails with [`HiveError::Timeout`] /
//! [`HiveError::Transport`] within the caller's timeout.
//!
//! - [`local::LocalNetwork`]: in-process routing with fault injection
//! - [`http::HttpRpc`]: JSON over HTTP between processes

pub mod http;
pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::broker::job::{base64_bytes, Job, Payload};
use crate::endpoint::Endpoint;
use crate::error::{HiveError, Result};

/// Inbound mailbox depth for brokers and workers
pub const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    /// Client -> broker: submit a job. Broker -> worker: run a job.
    Assign { job: Job },
    /// Worker -> broker: the held job finished with `result`.
    Done {
        #[serde(default, with = "base64_bytes::option")]
        job: Option<Payload>,
        #[serde(with = "base64_bytes")]
        result: Vec<u8>,
    },
    /// Worker -> broker: graceful departure.
    Leaving,
    /// Worker -> broker: heartbeat.
    Remind,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::Assign { .. } => "assign",
            Call::Done { .. } => "done",
            Call::Leaving => "leaving",
            Call::Remind => "remind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Caller identity; the broker attributes heartbeats and completions to it
    pub from: Endpoint,
    pub call: Call,
}

impl Request {
    pub fn new(from: Endpoint, call: Call) -> Self {
        Self { from, call }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Rejected { reason: String },
}

impl Reply {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Reply::Rejected {
            reason: reason.into(),
        }
    }
}

/// A request waiting in a mailbox, paired with the channel its reply goes to.
#[derive(Debug)]
pub struct Envelope {
    pub request: Request,
    pub reply_tx: oneshot::Sender<Reply>,
}

impl Envelope {
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Reply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (Self { request, reply_tx }, reply_rx)
    }

    /// Answer the caller. A caller that already gave up is not an error.
    pub fn reply(self, reply: Reply) {
        let _ = self.reply_tx.send(reply);
    }
}

/// Capability to call a remote procedure on a named endpoint.
#[async_trait]
pub trait Rpc: Clone + Send + Sync + 'static {
    /// Deliver `request` to `endpoint` and wait at most `timeout` for its reply.
    async fn call(&self, endpoint: &Endpoint, request: Request, timeout: Duration)
        -> Result<Reply>;

    /// Like [`Rpc::call`], treating a [`Reply::Rejected`] as an error.
    async fn call_ack(
        &self,
        endpoint: &Endpoint,
        request: Request,
        timeout: Duration,
    ) -> Result<()> {
        let method = request.call.method();
        match self.call(endpoint, request, timeout).await? {
            Reply::Ack => Ok(()),
            Reply::Rejected { reason } => Err(HiveError::Rejected {
                endpoint: endpoint.clone(),
                method,
                reason,
            }),
        }
    }
}
