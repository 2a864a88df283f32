use std::time::Duration;

use crate::broker::{BrokerMetrics, Job};
use crate::endpoint::Endpoint;
use crate::error::{HiveError, Result};
use crate::rpc::http::HttpRpc;
use crate::rpc::{Call, Request, Rpc};

/// Submitter-side access to a broker over HTTP.
///
/// Submission is idempotent by payload, so any error here is safe to retry.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    identity: Endpoint,
    broker: Endpoint,
    rpc: HttpRpc,
    http: reqwest::Client,
    timeout: Duration,
}

impl BrokerClient {
    pub fn new(broker: Endpoint, timeout: Duration) -> Self {
        let http = reqwest::Client::new();
        Self {
            identity: Endpoint::new(format!("client-{}", uuid::Uuid::new_v4())),
            broker,
            rpc: HttpRpc::with_client(http.clone()),
            http,
            timeout,
        }
    }

    pub fn broker(&self) -> &Endpoint {
        &self.broker
    }

    pub async fn submit(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let job = Job::new(payload);
        tracing::debug!(broker = %self.broker, job = %job, "Submitting job");
        let request = Request::new(self.identity.clone(), Call::Assign { job });
        self.rpc.call_ack(&self.broker, request, self.timeout).await
    }

    pub async fn status(&self) -> Result<BrokerMetrics> {
        let url = format!("{}/api/status", self.broker.base_url());
        let transport = |reason: String| HiveError::Transport {
            endpoint: self.broker.clone(),
            method: "status",
            reason,
        };

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(transport(format!("HTTP {}", response.status())));
        }
        response
            .json::<BrokerMetrics>()
            .await
            .map_err(|e| transport(e.to_string()))
    }
}
