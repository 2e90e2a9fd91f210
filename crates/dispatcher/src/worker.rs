//! Pool of dispatch workers sweeping the pending queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use bridge::Timestamp;

use crate::Dispatcher;

/// Handle to the spawned workers.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawns `dispatcher.config().workers` workers on the current runtime.
    ///
    /// Workers run until `shutdown` is cancelled.
    pub fn spawn(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Self {
        let count = dispatcher.config().workers;
        let handles = (0..count)
            .map(|worker| {
                let dispatcher = dispatcher.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(
                    run_worker(dispatcher, shutdown)
                        .instrument(tracing::info_span!("worker", worker)),
                )
            })
            .collect();
        info!(workers = count, "Dispatch workers started");
        Self {
            dispatcher,
            handles,
            shutdown,
        }
    }

    /// Cancels the workers and waits for in-flight attempts to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch worker panicked");
            }
        }
        info!(
            claim_conflicts = self.dispatcher.claim_conflicts(),
            "Dispatch workers stopped"
        );
    }
}

async fn run_worker(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    let poll_interval = dispatcher.config().poll_interval;
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let wait = match dispatcher.sweep(&shutdown).await {
            // Work was found; more may be waiting.
            Ok(sweep) if sweep.dispatched > 0 => continue,
            Ok(sweep) => sweep
                .next_due
                .map(|at| until(at).min(poll_interval))
                .unwrap_or(poll_interval),
            Err(e) => {
                error!(error = %e, "Sweep of pending tasks failed");
                poll_interval
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = dispatcher.woken() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("Dispatch worker stopped");
}

fn until(at: Timestamp) -> Duration {
    (at.as_datetime() - Timestamp::now().as_datetime())
        .to_std()
        .unwrap_or(Duration::ZERO)
}
