use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use jobhive::client::BrokerClient;
use jobhive::config::{
    BrokerConfig, ExecutorConfig, SandboxConfig, WorkerConfig, DEFAULT_BROKER_PORT,
    DEFAULT_WORKER_PORT,
};
use jobhive::endpoint::Endpoint;
use jobhive::node::{BrokerNode, WorkerNode};
use jobhive::rpc::http::DEFAULT_MAX_MESSAGE_BYTES;
use jobhive::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobhive")]
#[command(version)]
#[command(about = "A job broker and worker-pool coordinator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a broker
    Broker(BrokerArgs),

    /// Run a worker driving a work program over stdin/stdout
    Worker(WorkerArgs),

    /// Submit a job payload to a broker
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// Job payload (UTF-8)
        payload: String,
    },

    /// Show broker counts
    Status {
        #[command(flatten)]
        client: ClientArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Broker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    /// Address to listen on for RPC and the status API
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_BROKER_PORT)))]
    listen: SocketAddr,

    /// Liveness sweep period in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Sweeps a worker may miss before it is expired
    #[arg(long, default_value = "3")]
    max_pings: u32,

    /// Metrics log period in milliseconds
    #[arg(long, default_value = "10000")]
    metrics_interval_ms: u64,

    /// Timeout for each assign call to a worker, in milliseconds
    #[arg(long, default_value = "1000")]
    rpc_timeout_ms: u64,

    /// Largest RPC request body accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Address to listen on for assignments
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_WORKER_PORT)))]
    listen: SocketAddr,

    /// Address the broker should call back on (defaults to --listen)
    #[arg(long)]
    advertise: Option<String>,

    /// Broker address
    #[arg(long, short = 'b', default_value_t = format!("127.0.0.1:{}", DEFAULT_BROKER_PORT))]
    broker: String,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Timeout for each call to the broker, in milliseconds
    #[arg(long, default_value = "1000")]
    rpc_timeout_ms: u64,

    /// Largest RPC request body accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Run the work program inside this Docker image
    #[arg(long)]
    image: Option<String>,

    /// Work program and its arguments
    #[arg(last = true, required = true)]
    program: Vec<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Broker address
    #[arg(long, short = 'b', default_value_t = format!("127.0.0.1:{}", DEFAULT_BROKER_PORT))]
    broker: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,
}

impl ClientArgs {
    fn client(&self) -> BrokerClient {
        BrokerClient::new(
            Endpoint::new(self.broker.clone()),
            Duration::from_millis(self.timeout_ms),
        )
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = BrokerConfig {
        listen_addr: args.listen,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        max_pings: args.max_pings,
        metrics_interval_ms: args.metrics_interval_ms,
        rpc_timeout_ms: args.rpc_timeout_ms,
        max_message_bytes: args.max_message_bytes,
    };

    let shutdown = install_shutdown_handler();
    BrokerNode::bind(config).await?.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut program = args.program.into_iter();
    let executable = program.next().ok_or("missing work program")?;
    let mut executor = ExecutorConfig::new(executable).with_args(program);
    if let Some(image) = args.image {
        executor = executor.with_sandbox(SandboxConfig {
            image,
            ..SandboxConfig::default()
        });
    }

    let config = WorkerConfig {
        listen_addr: args.listen,
        advertise: args.advertise.map(Endpoint::new),
        broker: Endpoint::new(args.broker),
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        rpc_timeout_ms: args.rpc_timeout_ms,
        max_message_bytes: args.max_message_bytes,
        executor,
    };

    let shutdown = install_shutdown_handler();
    WorkerNode::bind(config).await?.run(shutdown).await?;
    Ok(())
}

async fn handle_submit(client: BrokerClient, payload: String) -> Result<(), Box<dyn std::error::Error>> {
    client.submit(payload.into_bytes()).await?;
    println!("Job submitted to {}", client.broker());
    Ok(())
}

async fn handle_status(
    client: BrokerClient,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = client.status().await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        OutputFormat::Table => {
            println!("Broker {}", client.broker());
            println!("{}", "=".repeat(30));
            println!("{:<12} {}", "Workers:", metrics.workers);
            println!("{:<12} {}", "Pending:", metrics.pending);
            println!("{:<12} {}", "Assigned:", metrics.assigned);
            println!("{:<12} {}", "Tracked:", metrics.jobs);
            println!("{:<12} {}", "Completed:", metrics.completed);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Broker(broker_args) => run_broker(broker_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Submit { client, payload } => handle_submit(client.client(), payload).await?,
        Commands::Status { client, output } => handle_status(client.client(), &output).await?,
    }

    Ok(())
}
