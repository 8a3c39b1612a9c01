// Worker pool - fixed set of workers sharing one queue

use super::constants::ABORT_DRAIN_TIMEOUT;
use super::{shutdown_channel, PipelineDeps, ShutdownSender, Worker, WorkerConfig};
use crate::application::cancel::CancellationRegistry;
use crate::application::retry::RetryPolicy;
use crate::port::AbortReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct WorkerPool {
    workers: JoinSet<()>,
    shutdown: ShutdownSender,
    cancellations: Arc<CancellationRegistry>,
    grace: Duration,
    size: usize,
}

impl WorkerPool {
    /// Spawn `config.effective_pool_size(cpus)` workers
    pub fn start(deps: PipelineDeps, config: WorkerConfig) -> Self {
        let size = config.effective_pool_size(deps.system_probe.cpu_count());
        let retry_policy = Arc::new(RetryPolicy::new(
            config.retry_base_delay_ms,
            config.max_finalize_attempts,
        ));
        let (shutdown, _) = shutdown_channel();
        let cancellations = Arc::clone(&deps.cancellations);

        let mut workers = JoinSet::new();
        for index in 0..size {
            let worker = Worker::new(
                format!("worker-{}", index),
                deps.clone(),
                Arc::clone(&retry_policy),
                config.clone(),
            );
            let token = shutdown.token();
            workers.spawn(async move {
                if let Err(e) = worker.run(token).await {
                    error!(worker_id = %worker.id(), error = %e, "Worker exited with error");
                }
            });
        }

        info!(
            size = size,
            requested = config.pool_size,
            "Worker pool started"
        );

        Self {
            workers,
            shutdown,
            cancellations,
            grace: config.shutdown_grace,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop claiming, give in-flight encodes the grace period, then abort
    /// whatever is still running. Aborted jobs go back to the queue with
    /// their attempt count unchanged.
    pub async fn shutdown(mut self) {
        info!(grace_ms = self.grace.as_millis() as u64, "Worker pool shutting down");
        self.shutdown.shutdown();

        if Self::drain(&mut self.workers, self.grace).await {
            info!("Worker pool stopped");
            return;
        }

        let aborted = self.cancellations.abort_all(AbortReason::Shutdown);
        warn!(aborted = aborted, "Grace period elapsed, aborting in-flight encodes");

        if !Self::drain(&mut self.workers, ABORT_DRAIN_TIMEOUT).await {
            error!(
                remaining = self.workers.len(),
                "Workers did not stop after abort, cancelling tasks"
            );
            self.workers.abort_all();
        }
        info!("Worker pool stopped");
    }

    async fn drain(workers: &mut JoinSet<()>, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task failed");
                }
            }
        })
        .await
        .is_ok()
    }
}
