// Crash recovery logic
use crate::application::progress::ProgressRegistry;
use crate::application::queue::JobQueueService;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::worker::ShutdownToken;
use crate::domain::{ClipId, ClipState, EncodeJob, FailureKind, JobState};
use crate::error::{AppError, Result};
use crate::port::{ArtifactStore, ClipStore, TimeProvider, Transcoder};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Crash recovery service
///
/// Reclaims jobs whose worker stopped heartbeating, both at daemon startup
/// and periodically while running.
pub struct RecoveryService {
    queue: Arc<JobQueueService>,
    clips: Arc<dyn ClipStore>,
    artifacts: Arc<dyn ArtifactStore>,
    transcoder: Arc<dyn Transcoder>,
    progress: Arc<ProgressRegistry>,
    retry_policy: Arc<RetryPolicy>,
    time_provider: Arc<dyn TimeProvider>,
    liveness_ms: i64,
}

/// What one recovery pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub killed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed + self.cancelled
    }
}

impl RecoveryService {
    /// Create a new recovery service
    ///
    /// # Arguments
    /// * `liveness_ms` - A claim without a heartbeat for this long is reclaimed
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<JobQueueService>,
        clips: Arc<dyn ClipStore>,
        artifacts: Arc<dyn ArtifactStore>,
        transcoder: Arc<dyn Transcoder>,
        progress: Arc<ProgressRegistry>,
        retry_policy: Arc<RetryPolicy>,
        time_provider: Arc<dyn TimeProvider>,
        liveness_ms: i64,
    ) -> Self {
        Self {
            queue,
            clips,
            artifacts,
            transcoder,
            progress,
            retry_policy,
            time_provider,
            liveness_ms,
        }
    }

    /// Startup recovery.
    ///
    /// The daemon is the only writer of its database, so at startup every
    /// claimed job belongs to a dead process and is reclaimed regardless of
    /// heartbeat age. Queued jobs get their `-1` progress entry back.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let now = self.time_provider.now_millis();
        info!("Starting startup recovery");

        let report = self.recover_claims_older_than(now + 1).await?;
        let repaired = self.repair_failed_clips().await?;
        let rehydrated = self.rehydrate_progress().await?;
        let swept = self.sweep_orphaned_staging().await?;

        info!(
            requeued = report.requeued,
            failed = report.failed,
            cancelled = report.cancelled,
            killed = report.killed,
            repaired_clips = repaired,
            rehydrated = rehydrated,
            swept_staging = swept,
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Reclaim jobs whose last heartbeat is older than the liveness window
    pub async fn recover_stale_jobs(&self) -> Result<RecoveryReport> {
        let cutoff = self.time_provider.now_millis() - self.liveness_ms;
        self.recover_claims_older_than(cutoff).await
    }

    async fn recover_claims_older_than(&self, cutoff: i64) -> Result<RecoveryReport> {
        let stale = self.queue.store().find_stale(cutoff).await?;
        let mut report = RecoveryReport::default();

        for job in stale {
            warn!(
                job_id = %job.id,
                clip_id = %job.clip_id,
                worker_id = ?job.worker_id,
                heartbeat_at = ?job.heartbeat_at,
                pid = ?job.pid,
                "Recovering abandoned job"
            );
            if let Err(e) = self.recover_single_job(job, &mut report).await {
                error!(error = %e, "Failed to recover job");
            }
        }

        if report.total() > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                cancelled = report.cancelled,
                "Abandoned job recovery complete"
            );
        }
        Ok(report)
    }

    /// Recover a single abandoned job
    async fn recover_single_job(&self, mut job: EncodeJob, report: &mut RecoveryReport) -> Result<()> {
        if let Some(pid) = job.pid {
            if self.transcoder.is_alive(pid) {
                warn!(job_id = %job.id, pid = %pid, "Abandoned encoder still alive, killing");
                match self.transcoder.kill(pid).await {
                    Ok(()) => report.killed += 1,
                    Err(e) => error!(job_id = %job.id, pid = %pid, error = %e, "Failed to kill encoder"),
                }
            }
        }

        let Some(token) = job.claim_token.clone() else {
            return Ok(());
        };
        let now = self.time_provider.now_millis();

        if self.clips.get_state(&job.clip_id).await?.is_none() {
            let staged = job.staged_dir.clone();
            job.cancel(now)?;
            if self.queue.persist(&job, &token).await? {
                report.cancelled += 1;
                self.progress.clear(&job.clip_id);
                self.discard(staged.as_deref()).await;
            }
            return Ok(());
        }

        match self.retry_policy.decide(&job, FailureKind::WorkerCrash) {
            RetryDecision::Retry(delay_ms) => {
                let staged = job.staged_dir.clone();
                if self
                    .queue
                    .requeue(&mut job, FailureKind::WorkerCrash, "worker stopped heartbeating", delay_ms)
                    .await?
                {
                    report.requeued += 1;
                    self.discard(staged.as_deref()).await;
                }
            }
            // WorkerCrash is never a storage failure
            RetryDecision::RetryFinalize(_) | RetryDecision::Failed => {
                let staged = job.staged_dir.clone();
                job.fail(FailureKind::WorkerCrash, "worker stopped heartbeating", now)?;
                if self.queue.persist(&job, &token).await? {
                    report.failed += 1;
                    self.discard(staged.as_deref()).await;
                    self.settle_failed_clip(&job.clip_id, now).await?;
                }
            }
        }
        Ok(())
    }

    /// Mark the clip failed and drop everything stored for it
    async fn settle_failed_clip(&self, clip_id: &ClipId, now: i64) -> Result<()> {
        match self.clips.set_state(clip_id, ClipState::Failed, now).await {
            Ok(()) | Err(AppError::NotFound(_)) | Err(AppError::ClipSettled { .. }) => {}
            Err(e) => return Err(e),
        }
        self.progress.mark_failed(clip_id);
        if let Err(e) = self.artifacts.delete_outputs(clip_id).await {
            warn!(clip_id = %clip_id, error = %e, "Failed to delete outputs");
        }
        if let Err(e) = self.artifacts.delete_source(clip_id).await {
            warn!(clip_id = %clip_id, error = %e, "Failed to delete source");
        }
        Ok(())
    }

    /// Settle clips still in Encoding whose job already failed.
    ///
    /// A job is written as Failed before its clip, so a crash between the
    /// two writes leaves the clip with no live job to move it on.
    pub async fn repair_failed_clips(&self) -> Result<usize> {
        let now = self.time_provider.now_millis();
        let mut repaired = 0;

        for job in self.queue.store().find_by_state(JobState::Failed).await? {
            if self.clips.get_state(&job.clip_id).await? != Some(ClipState::Encoding) {
                continue;
            }
            if self.queue.store().find_live_by_clip(&job.clip_id).await?.is_some() {
                continue;
            }
            warn!(job_id = %job.id, clip_id = %job.clip_id, "Clip left encoding after its job failed");
            self.settle_failed_clip(&job.clip_id, now).await?;
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Seed `-1` for every queued job (the registry lives in memory)
    pub async fn rehydrate_progress(&self) -> Result<usize> {
        let queued = self.queue.store().find_by_state(JobState::Queued).await?;
        Ok(queued
            .iter()
            .filter(|job| self.progress.mark_queued_if_absent(&job.clip_id, job.attempt))
            .count())
    }

    /// Remove staging directories no live job refers to
    pub async fn sweep_orphaned_staging(&self) -> Result<usize> {
        let mut referenced = HashSet::new();
        for state in JobState::LIVE {
            for job in self.queue.store().find_by_state(state).await? {
                if let Some(dir) = job.staged_dir {
                    referenced.insert(dir);
                }
            }
        }

        let mut removed = 0;
        for entry in self.artifacts.list_staged().await? {
            let dir = entry.dir.to_string_lossy().to_string();
            if referenced.contains(&dir) {
                continue;
            }
            // A running encode owns its directory before it is recorded on the job
            if let Some(live) = self.queue.store().find_live_by_clip(&entry.clip_id).await? {
                if live.state.is_claimed() && live.attempt == entry.attempt {
                    continue;
                }
            }
            self.discard(Some(&dir)).await;
            removed += 1;
        }

        if removed > 0 {
            info!(removed = removed, "Removed orphaned staging directories");
        }
        Ok(removed)
    }

    /// Periodic recovery loop (background task)
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownToken) {
        info!(
            interval_ms = interval.as_millis() as u64,
            liveness_ms = self.liveness_ms,
            "Recovery loop started"
        );
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.wait() => break,
            }
            if let Err(e) = self.recover_stale_jobs().await {
                error!(error = %e, "Recovery pass failed");
            }
            if let Err(e) = self.repair_failed_clips().await {
                error!(error = %e, "Clip repair failed");
            }
            if let Err(e) = self.sweep_orphaned_staging().await {
                error!(error = %e, "Staging sweep failed");
            }
        }
        info!("Recovery loop stopped");
    }

    async fn discard(&self, staged: Option<&str>) {
        if let Some(dir) = staged {
            if let Err(e) = self.artifacts.discard_staged(Path::new(dir)).await {
                warn!(staged = %dir, error = %e, "Failed to discard staged output");
            }
        }
    }
}
