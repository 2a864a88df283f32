//! Process-level wiring for brokers and workers.
//!
//! A node binds its HTTP listener, builds the transport, spawns the actor and
//! ties everything to one shutdown token. Binding is a separate step so
//! callers (and tests) can listen on port 0 and learn the real address
//! before anything runs.

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{self, Broker, BrokerHandle};
use crate::config::{BrokerConfig, WorkerConfig};
use crate::dashboard::{self, DashboardState};
use crate::endpoint::Endpoint;
use crate::error::{HiveError, Result};
use crate::rpc::http::{self, HttpRpc};
use crate::rpc::MAILBOX_CAPACITY;
use crate::worker::{self, ExecutionUnit, WorkerRuntime};

pub struct BrokerNode {
    config: BrokerConfig,
    listener: TcpListener,
    endpoint: Endpoint,
}

/// A broker serving HTTP, returned by [`BrokerNode::start`].
pub struct RunningBroker {
    pub endpoint: Endpoint,
    pub handle: BrokerHandle,
    actor: JoinHandle<()>,
    server: JoinHandle<Result<()>>,
}

impl BrokerNode {
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        let endpoint = Endpoint::from(listener.local_addr()?);
        Ok(Self {
            config,
            listener,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Spawn the broker actor and its HTTP server (RPC plus dashboard).
    pub fn start(self, shutdown: CancellationToken) -> RunningBroker {
        let Self {
            config,
            listener,
            endpoint,
        } = self;

        tracing::info!(
            endpoint = %endpoint,
            heartbeat_interval_ms = config.heartbeat_interval_ms,
            max_pings = config.max_pings,
            rpc_timeout_ms = config.rpc_timeout_ms,
            "Starting broker node"
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let max_message_bytes = config.max_message_bytes;
        let broker = Broker::new(endpoint.clone(), config, HttpRpc::new());
        let (handle, actor) = broker::actor::spawn(broker, inbound_rx, shutdown.clone());

        let app = http::router(inbound_tx.clone(), max_message_bytes).merge(dashboard::router(
            DashboardState {
                broker: handle.clone(),
                inbound: inbound_tx,
            },
        ));
        let server = tokio::spawn(http::serve(listener, app, shutdown));

        RunningBroker {
            endpoint,
            handle,
            actor,
            server,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.start(shutdown).wait().await
    }
}

impl RunningBroker {
    pub async fn wait(self) -> Result<()> {
        let served = join(self.server).await;
        if let Err(e) = self.actor.await {
            tracing::error!(error = %e, "Broker task failed");
        }
        served
    }
}

pub struct WorkerNode {
    config: WorkerConfig,
    listener: TcpListener,
    endpoint: Endpoint,
}

/// A worker serving HTTP, returned by [`WorkerNode::start`].
pub struct RunningWorker {
    pub endpoint: Endpoint,
    pub runtime: WorkerRuntime<HttpRpc>,
    worker: JoinHandle<()>,
    server: JoinHandle<Result<()>>,
}

impl WorkerNode {
    pub async fn bind(config: WorkerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        // Port 0 only becomes a usable identity once bound
        let endpoint = match &config.advertise {
            Some(advertise) => advertise.clone(),
            None => Endpoint::from(listener.local_addr()?),
        };
        Ok(Self {
            config,
            listener,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Launch the configured work program and start serving.
    pub fn start(self, shutdown: CancellationToken) -> Result<RunningWorker> {
        self.config.validate()?;
        let (unit, results) = ExecutionUnit::spawn_process(&self.config.executor)?;
        Ok(self.start_with(unit, results, shutdown))
    }

    /// Start serving with an already constructed execution unit.
    pub fn start_with(
        self,
        unit: ExecutionUnit,
        results: mpsc::Receiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> RunningWorker {
        let Self {
            config,
            listener,
            endpoint,
        } = self;

        tracing::info!(
            endpoint = %endpoint,
            broker = %config.broker,
            heartbeat_interval_ms = config.heartbeat_interval_ms,
            "Starting worker node"
        );

        let runtime = WorkerRuntime::new(
            endpoint.clone(),
            config.broker.clone(),
            HttpRpc::new(),
            unit,
            config.heartbeat_interval(),
            config.rpc_timeout(),
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(MAILBOX_CAPACITY);
        // The server outlives the worker loop only until the loop has left the broker
        let server_stop = CancellationToken::new();
        let server = tokio::spawn(http::serve(
            listener,
            http::router(inbound_tx, config.max_message_bytes),
            server_stop.clone(),
        ));

        let worker = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                worker::run(runtime, results, inbound_rx, shutdown).await;
                server_stop.cancel();
            })
        };

        RunningWorker {
            endpoint,
            runtime,
            worker,
            server,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.start(shutdown)?.wait().await
    }
}

impl RunningWorker {
    pub async fn wait(self) -> Result<()> {
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "Worker task failed");
        }
        join(self.server).await
    }
}

async fn join(server: JoinHandle<Result<()>>) -> Result<()> {
    server
        .await
        .map_err(|e| HiveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
