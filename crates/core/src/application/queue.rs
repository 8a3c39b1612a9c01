// Job Queue Service - enqueue / dequeue / complete / requeue

use crate::application::progress::ProgressRegistry;
use crate::application::worker::constants::DEQUEUE_POLL_INTERVAL;
use crate::application::worker::ShutdownToken;
use crate::domain::{validate_clip_id, ClipId, EncodeJob, FailureKind, JobId};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, JobQueue, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Queue front-end shared by the intake side and the worker pool.
///
/// Wraps the durable [`JobQueue`] with a wake-up signal so blocked dequeuers
/// react to new work immediately, and keeps the progress registry in step
/// with enqueue and requeue.
pub struct JobQueueService {
    queue: Arc<dyn JobQueue>,
    progress: Arc<ProgressRegistry>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    available: Notify,
    max_attempts: i32,
    poll_interval: Duration,
}

impl JobQueueService {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        progress: Arc<ProgressRegistry>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        max_attempts: i32,
    ) -> Self {
        Self {
            queue,
            progress,
            id_provider,
            time_provider,
            available: Notify::new(),
            max_attempts,
            poll_interval: DEQUEUE_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Enqueue an encode job for a clip
    ///
    /// # Errors
    /// - `AppError::Domain` if the clip id is malformed
    /// - `AppError::DuplicateJob` if the clip already has a live job
    pub async fn enqueue(&self, clip_id: &ClipId) -> Result<JobId> {
        validate_clip_id(clip_id)?;

        if let Some(existing) = self.queue.find_live_by_clip(clip_id).await? {
            debug!(clip_id = %clip_id, job_id = %existing.id, "Clip already has a live job");
            return Err(AppError::DuplicateJob(clip_id.clone()));
        }

        let job = EncodeJob::new(
            self.id_provider.generate_id(),
            clip_id.clone(),
            self.time_provider.now_millis(),
            self.max_attempts,
        );

        // The unique index on live jobs catches a concurrent enqueue
        self.queue.insert(&job).await?;
        self.progress.mark_queued(clip_id, job.attempt);
        self.available.notify_one();

        info!(job_id = %job.id, clip_id = %clip_id, "Job enqueued");
        Ok(job.id)
    }

    /// Claim the next job, waiting until one is available.
    ///
    /// Returns `None` once shutdown is signalled.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        shutdown: &mut ShutdownToken,
    ) -> Result<Option<EncodeJob>> {
        loop {
            if shutdown.is_shutdown() {
                return Ok(None);
            }

            let claim_token = self.id_provider.generate_id();
            let now = self.time_provider.now_millis();
            if let Some(job) = self.queue.claim_next(worker_id, &claim_token, now).await? {
                debug!(
                    job_id = %job.id,
                    clip_id = %job.clip_id,
                    worker_id = %worker_id,
                    attempt = job.attempt,
                    "Job claimed"
                );
                return Ok(Some(job));
            }

            tokio::select! {
                _ = self.available.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.wait() => return Ok(None),
            }
        }
    }

    /// Mark a finalizing job as done
    pub async fn complete(&self, job: &mut EncodeJob) -> Result<bool> {
        let token = claim_token_of(job)?;
        job.complete(self.time_provider.now_millis())?;
        self.persist(job, &token).await
    }

    /// Requeue for another attempt after `delay_ms`; progress goes back to -1
    pub async fn requeue(
        &self,
        job: &mut EncodeJob,
        kind: FailureKind,
        message: &str,
        delay_ms: i64,
    ) -> Result<bool> {
        let token = claim_token_of(job)?;
        let available_at = self.time_provider.now_millis() + delay_ms;
        job.requeue_for_retry(kind, message, available_at)?;
        self.requeued(job, &token).await
    }

    /// Requeue to retry publication of the staged output only
    pub async fn requeue_finalize(&self, job: &mut EncodeJob, message: &str, delay_ms: i64) -> Result<bool> {
        let token = claim_token_of(job)?;
        let available_at = self.time_provider.now_millis() + delay_ms;
        job.requeue_for_finalize(message, available_at)?;
        self.requeued(job, &token).await
    }

    /// Give the job back without consuming an attempt
    pub async fn release(&self, job: &mut EncodeJob) -> Result<bool> {
        let token = claim_token_of(job)?;
        job.release(self.time_provider.now_millis())?;
        self.requeued(job, &token).await
    }

    /// Write a job the caller holds the claim for
    pub async fn persist(&self, job: &EncodeJob, claim_token: &str) -> Result<bool> {
        let applied = self.queue.update_claimed(job, claim_token).await?;
        if !applied {
            warn!(
                job_id = %job.id,
                clip_id = %job.clip_id,
                state = %job.state,
                "Claim no longer held, write rejected"
            );
        }
        Ok(applied)
    }

    async fn requeued(&self, job: &EncodeJob, claim_token: &str) -> Result<bool> {
        let applied = self.persist(job, claim_token).await?;
        if applied {
            self.progress.mark_queued(&job.clip_id, job.attempt);
            self.available.notify_one();
            info!(
                job_id = %job.id,
                clip_id = %job.clip_id,
                attempt = job.attempt,
                phase = %job.phase,
                available_at = job.available_at,
                "Job requeued"
            );
        }
        Ok(applied)
    }
}

fn claim_token_of(job: &EncodeJob) -> Result<String> {
    job.claim_token.clone().ok_or_else(|| AppError::Unclaimed {
        job_id: job.id.clone(),
        state: job.state,
    })
}
