use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerMetrics, BrokerSnapshot, Completion};
use crate::rpc::{Envelope, Reply, Rpc};
use crate::timer::Rearm;

/// Local control messages for a running broker
#[derive(Debug)]
pub enum BrokerCommand {
    Snapshot {
        response_tx: oneshot::Sender<BrokerSnapshot>,
    },
    /// Check bookkeeping invariants and report the first violation
    Verify {
        response_tx: oneshot::Sender<Result<(), String>>,
    },
    Exit,
}

/// Cloneable handle to a broker running on its own task.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<BrokerCommand>,
    completions: broadcast::Sender<Completion>,
}

impl BrokerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.completions.subscribe()
    }

    /// `None` once the broker task has stopped.
    pub async fn snapshot(&self) -> Option<BrokerSnapshot> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Snapshot { response_tx })
            .await
            .ok()?;
        response_rx.await.ok()
    }

    pub async fn metrics(&self) -> Option<BrokerMetrics> {
        self.snapshot().await.map(|s| s.metrics)
    }

    pub async fn verify(&self) -> Option<Result<(), String>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Verify { response_tx })
            .await
            .ok()?;
        response_rx.await.ok()
    }

    pub async fn exit(&self) {
        let _ = self.commands.send(BrokerCommand::Exit).await;
    }
}

/// Start `broker` on a new task serving requests from `inbound`.
pub fn spawn<R: Rpc>(
    broker: Broker<R>,
    inbound: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) -> (BrokerHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let handle = BrokerHandle {
        commands: commands_tx,
        completions: broker.completion_feed(),
    };
    let task = tokio::spawn(run(broker, inbound, commands_rx, shutdown));
    (handle, task)
}

/// Broker event loop.
///
/// Inbound calls, control commands and the `gc`/`metrics` timers are
/// serviced one at a time, each to completion, so no two operations ever
/// observe each other's partial updates.
pub async fn run<R: Rpc>(
    mut broker: Broker<R>,
    mut inbound: mpsc::Receiver<Envelope>,
    mut commands: mpsc::Receiver<BrokerCommand>,
    shutdown: CancellationToken,
) {
    let mut gc_timer = Rearm::after(broker.config().heartbeat_interval());
    let mut metrics_timer = Rearm::after(broker.config().metrics_interval());

    tracing::info!(endpoint = %broker.endpoint(), "Broker started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                broker.exit();
                break;
            }

            Some(command) = commands.recv() => {
                match command {
                    BrokerCommand::Snapshot { response_tx } => {
                        let _ = response_tx.send(broker.snapshot());
                    }
                    BrokerCommand::Verify { response_tx } => {
                        let _ = response_tx.send(broker.check_invariants());
                    }
                    BrokerCommand::Exit => {
                        broker.exit();
                        break;
                    }
                }
            }

            _ = gc_timer.sleep() => {
                let next = broker.gc().await;
                gc_timer.rearm(next);
            }

            _ = metrics_timer.sleep() => {
                let next = broker.metrics();
                metrics_timer.rearm(next);
            }

            Some(envelope) = inbound.recv() => {
                let Envelope { request, reply_tx } = envelope;
                let reply = broker.handle(request).await;
                let _ = reply_tx.send(reply);
            }
        }
    }

    // Refuse whatever is still queued so callers fail fast
    inbound.close();
    while let Ok(envelope) = inbound.try_recv() {
        envelope.reply(Reply::rejected("broker is shutting down"));
    }
    tracing::info!(endpoint = %broker.endpoint(), "Broker stopped");
}
