use std::net::SocketAddr;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::{HiveError, Result};
use crate::rpc::http::DEFAULT_MAX_MESSAGE_BYTES;

pub const DEFAULT_BROKER_PORT: u16 = 7700;
pub const DEFAULT_WORKER_PORT: u16 = 7701;

/// Configuration for Docker-based sandboxing of the execution unit.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image the work program runs in
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// The work program a worker drives over its execution channel.
///
/// The program reads length-prefixed job payloads on stdin and writes one
/// length-prefixed result per job on stdout.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Run the program inside `docker run -i` when set
    pub sandbox: Option<SandboxConfig>,
}

impl ExecutorConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = Some(sandbox);
        self
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    /// Period of the liveness sweep; also the expected worker heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Sweeps a worker may miss before it is considered lost
    pub max_pings: u32,
    pub metrics_interval_ms: u64,
    /// Bound on each outbound `assign` call
    pub rpc_timeout_ms: u64,
    /// Largest inbound RPC body the broker accepts
    pub max_message_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT)),
            heartbeat_interval_ms: 1000,
            max_pings: 3,
            metrics_interval_ms: 10_000,
            rpc_timeout_ms: 1000,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        non_zero("heartbeat interval", self.heartbeat_interval_ms)?;
        non_zero("metrics interval", self.metrics_interval_ms)?;
        non_zero("rpc timeout", self.rpc_timeout_ms)?;
        message_limit(self.max_message_bytes)?;
        if self.max_pings == 0 {
            return Err(HiveError::Config(
                "max missed heartbeats must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// Identity the broker uses to call back; defaults to `listen_addr`
    pub advertise: Option<Endpoint>,
    pub broker: Endpoint,
    pub heartbeat_interval_ms: u64,
    /// Bound on each `remind`/`done`/`leaving` call
    pub rpc_timeout_ms: u64,
    /// Largest inbound RPC body the worker accepts
    pub max_message_bytes: usize,
    pub executor: ExecutorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_WORKER_PORT)),
            advertise: None,
            broker: Endpoint::from(SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT))),
            heartbeat_interval_ms: 1000,
            rpc_timeout_ms: 1000,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            executor: ExecutorConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(listen_addr: SocketAddr, broker: Endpoint) -> Self {
        Self {
            listen_addr,
            broker,
            ..Default::default()
        }
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.advertise
            .clone()
            .unwrap_or_else(|| Endpoint::from(self.listen_addr))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        non_zero("heartbeat interval", self.heartbeat_interval_ms)?;
        non_zero("rpc timeout", self.rpc_timeout_ms)?;
        message_limit(self.max_message_bytes)?;
        if self.executor.program.trim().is_empty() {
            return Err(HiveError::Config("executor program is empty".to_string()));
        }
        Ok(())
    }
}

fn non_zero(name: &str, value_ms: u64) -> Result<()> {
    if value_ms == 0 {
        return Err(HiveError::Config(format!("{name} must be greater than zero")));
    }
    Ok(())
}

fn message_limit(bytes: usize) -> Result<()> {
    if bytes == 0 {
        return Err(HiveError::Config(
            "max message size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
