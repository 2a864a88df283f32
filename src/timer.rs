use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::CancellationToken;

/// A one-shot deadline that a periodic callback re-arms with the interval it
/// returns.
#[derive(Debug, Clone, Copy)]
pub struct Rearm {
    deadline: Instant,
}

impl Rearm {
    pub fn after(delay: Duration) -> Self {
        Self {
            deadline: Instant::now() + delay,
        }
    }

    /// Owned sleep future for use inside `select!`.
    pub fn sleep(&self) -> Sleep {
        sleep_until(self.deadline)
    }

    pub fn rearm(&mut self, interval: Duration) {
        self.deadline = Instant::now() + interval;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Run `tick` after `first`, then again after whatever interval each call
/// returns, until `shutdown` is cancelled.
pub fn spawn_periodic<F, Fut>(
    first: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Duration> + Send,
{
    tokio::spawn(async move {
        let mut timer = Rearm::after(first);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = timer.sleep() => {
                    let next = tick().await;
                    timer.rearm(next);
                }
            }
        }
    })
}
