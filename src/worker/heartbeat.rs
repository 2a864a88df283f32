use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::rpc::{Call, Request, Rpc};

/// Sends `remind` to the broker on behalf of one worker.
#[derive(Debug, Clone)]
pub struct HeartbeatSender<R> {
    rpc: R,
    identity: Endpoint,
    broker: Endpoint,
    interval: Duration,
    timeout: Duration,
}

impl<R: Rpc> HeartbeatSender<R> {
    pub fn new(
        rpc: R,
        identity: Endpoint,
        broker: Endpoint,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            identity,
            broker,
            interval,
            timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Send one heartbeat and return the delay until the next. A failed
    /// heartbeat is skipped; the broker's sweep tolerates a few misses.
    pub async fn beat(&self) -> Duration {
        let request = Request::new(self.identity.clone(), Call::Remind);
        match self.rpc.call_ack(&self.broker, request, self.timeout).await {
            Ok(()) => tracing::debug!(worker = %self.identity, broker = %self.broker, "Heartbeat sent"),
            Err(e) => tracing::warn!(
                worker = %self.identity,
                broker = %self.broker,
                error = %e,
                "Heartbeat failed"
            ),
        }
        self.interval
    }
}
