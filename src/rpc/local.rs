use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;
use crate::error::{HiveError, Result};
use crate::rpc::{Envelope, Reply, Request, Rpc, MAILBOX_CAPACITY};

/// Simulated network failure for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Calls fail immediately, like a refused connection
    Unreachable,
    /// Calls hang until the caller's timeout fires
    Stall,
}

#[derive(Debug, Default)]
struct Routes {
    mailboxes: HashMap<Endpoint, mpsc::Sender<Envelope>>,
    faults: HashMap<Endpoint, Fault>,
}

/// In-process transport routing calls straight into peer mailboxes.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        // Routes stay consistent even if a holder panicked mid-update
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a fresh mailbox to `endpoint`, replacing any previous one.
    pub fn bind(&self, endpoint: Endpoint) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.routes().mailboxes.insert(endpoint, tx);
        rx
    }

    pub fn unbind(&self, endpoint: &Endpoint) {
        self.routes().mailboxes.remove(endpoint);
    }

    pub fn inject(&self, endpoint: Endpoint, fault: Fault) {
        tracing::debug!(endpoint = %endpoint, ?fault, "Injecting network fault");
        self.routes().faults.insert(endpoint, fault);
    }

    pub fn heal(&self, endpoint: &Endpoint) {
        self.routes().faults.remove(endpoint);
    }

    pub fn is_bound(&self, endpoint: &Endpoint) -> bool {
        self.routes().mailboxes.contains_key(endpoint)
    }
}

#[async_trait]
impl Rpc for LocalNetwork {
    async fn call(
        &self,
        endpoint: &Endpoint,
        request: Request,
        timeout: Duration,
    ) -> Result<Reply> {
        let method = request.call.method();
        let transport_error = |reason: &str| HiveError::Transport {
            endpoint: endpoint.clone(),
            method,
            reason: reason.to_string(),
        };

        let (mailbox, fault) = {
            let routes = self.routes();
            (
                routes.mailboxes.get(endpoint).cloned(),
                routes.faults.get(endpoint).copied(),
            )
        };

        match fault {
            Some(Fault::Unreachable) => return Err(transport_error("endpoint unreachable")),
            Some(Fault::Stall) => {
                tokio::time::sleep(timeout).await;
                return Err(HiveError::Timeout {
                    endpoint: endpoint.clone(),
                    method,
                });
            }
            None => {}
        }

        let mailbox = mailbox.ok_or_else(|| transport_error("connection refused"))?;
        let (envelope, reply_rx) = Envelope::new(request);

        let exchange = async move {
            mailbox
                .send(envelope)
                .await
                .map_err(|_| "mailbox closed")?;
            reply_rx.await.map_err(|_| "reply dropped")
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(reason)) => Err(transport_error(reason)),
            Err(_) => Err(HiveError::Timeout {
                endpoint: endpoint.clone(),
                method,
            }),
        }
    }
}
