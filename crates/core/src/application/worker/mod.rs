// Worker - encode job execution loop

pub mod config;
pub mod constants;
mod heartbeat;
mod panic_guard;
mod pool;
mod shutdown; // Public for use in other modules

use constants::*;
pub use config::WorkerConfig;
pub use panic_guard::{execute_guarded, PanicGuardResult};
pub use pool::WorkerPool;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::cancel::{CancellationRegistry, RegistrationId};
use crate::application::progress::ProgressRegistry;
use crate::application::queue::JobQueueService;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::domain::{ArtifactSet, ClipState, DomainError, EncodeJob, FailureKind, JobPhase, TranscodeOutput};
use crate::error::{AppError, Result};
use crate::port::{
    AbortReason, AbortSignal, ArtifactStore, ClipStore, SystemProbe, TimeProvider, TranscodeError,
    TranscodeRequest, Transcoder,
};
use heartbeat::Heartbeat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Everything a worker touches, shared by the whole pool
#[derive(Clone)]
pub struct PipelineDeps {
    pub queue: Arc<JobQueueService>,
    pub clips: Arc<dyn ClipStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub transcoder: Arc<dyn Transcoder>,
    pub progress: Arc<ProgressRegistry>,
    pub cancellations: Arc<CancellationRegistry>,
    pub system_probe: Arc<dyn SystemProbe>,
    pub time_provider: Arc<dyn TimeProvider>,
}

/// Why one attempt did not publish
enum AttemptError {
    Failed { kind: FailureKind, message: String },
    Aborted(AbortReason),
    Internal(AppError),
}

impl AttemptError {
    fn failed(kind: FailureKind, message: impl std::fmt::Display) -> Self {
        AttemptError::Failed {
            kind,
            message: message.to_string(),
        }
    }
}

impl From<AppError> for AttemptError {
    fn from(err: AppError) -> Self {
        AttemptError::Internal(err)
    }
}

impl From<DomainError> for AttemptError {
    fn from(err: DomainError) -> Self {
        AttemptError::Internal(err.into())
    }
}

type Attempt<T> = std::result::Result<T, AttemptError>;

/// Removes this job's abort sender once it leaves the worker
struct Registration {
    registry: Arc<CancellationRegistry>,
    clip_id: String,
    id: RegistrationId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.clip_id, self.id);
    }
}

/// Worker claims encode jobs and drives each one to a settled state
pub struct Worker {
    id: String,
    deps: PipelineDeps,
    retry_policy: Arc<RetryPolicy>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        deps: PipelineDeps,
        retry_policy: Arc<RetryPolicy>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            deps,
            retry_policy,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run worker loop with graceful shutdown support.
    ///
    /// Shutdown stops claiming; a job already in progress runs to completion
    /// unless the pool aborts it.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(worker_id = %self.id, "Worker started");
        loop {
            if shutdown.is_shutdown() {
                break;
            }

            if self.disk_low().await {
                tokio::select! {
                    _ = sleep(DISK_GUARD_SLEEP_DURATION) => continue,
                    _ = shutdown.wait() => break,
                }
            }

            match self.deps.queue.dequeue(&self.id, &mut shutdown).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process_job(job).await {
                        error!(worker_id = %self.id, error = %e, "Job processing error");
                        tokio::select! {
                            _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                            _ = shutdown.wait() => break,
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }
        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    async fn disk_low(&self) -> bool {
        if self.config.min_free_disk_mb == 0 {
            return false;
        }
        let metrics = self.deps.system_probe.get_metrics().await;
        if metrics.disk_available_mb < self.config.min_free_disk_mb {
            warn!(
                available_mb = metrics.disk_available_mb,
                threshold_mb = self.config.min_free_disk_mb,
                "Low disk space, pausing job intake"
            );
            return true;
        }
        false
    }

    /// Drive one claimed job to done, requeued, failed or cancelled
    pub async fn process_job(&self, mut job: EncodeJob) -> Result<()> {
        let token = job.claim_token.clone().ok_or_else(|| AppError::Unclaimed {
            job_id: job.id.clone(),
            state: job.state,
        })?;
        let clip_id = job.clip_id.clone();

        // Register before reading the clip so a concurrent delete is never missed
        let (registration_id, abort) = self.deps.cancellations.register(&clip_id);
        let _registration = Registration {
            registry: Arc::clone(&self.deps.cancellations),
            clip_id: clip_id.clone(),
            id: registration_id,
        };

        if !self.prepare(&mut job, &token).await? {
            return Ok(());
        }

        let (pid_tx, pid_rx) = watch::channel(None);
        let _heartbeat = Heartbeat {
            queue: Arc::clone(self.deps.queue.store()),
            time_provider: Arc::clone(&self.deps.time_provider),
            cancellations: Arc::clone(&self.deps.cancellations),
            interval: self.config.heartbeat_interval,
        }
        .spawn(job.id.clone(), clip_id, token.clone(), pid_rx);

        match self.attempt(&mut job, &token, abort, pid_tx).await {
            Ok(artifacts) => self.finish(&mut job, &token, artifacts).await,
            Err(err) => self.settle_failure(&mut job, &token, err).await,
        }
    }

    /// Check the clip and move the job to running. `false` means the job was
    /// settled without encoding.
    async fn prepare(&self, job: &mut EncodeJob, token: &str) -> Result<bool> {
        let now = self.deps.time_provider.now_millis();

        let state = match self.deps.clips.get_state(&job.clip_id).await? {
            None => {
                info!(job_id = %job.id, clip_id = %job.clip_id, "Clip deleted, dropping job");
                self.drop_job(job, token).await?;
                return Ok(false);
            }
            Some(state) if state.is_terminal() => {
                self.close_for_settled_clip(job, token, state).await?;
                return Ok(false);
            }
            Some(state) => state,
        };

        if job.phase == JobPhase::Encode {
            job.start(now)?;
            if !self.deps.queue.persist(job, token).await? {
                return Ok(false);
            }
        }

        if state != ClipState::Encoding {
            let next = state.transition(ClipState::Encoding)?;
            match self.deps.clips.set_state(&job.clip_id, next, now).await {
                Ok(()) => {}
                Err(AppError::NotFound(_)) => {
                    self.drop_job(job, token).await?;
                    return Ok(false);
                }
                Err(AppError::ClipSettled { state, .. }) => {
                    self.close_for_settled_clip(job, token, state).await?;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            clip_id = %job.clip_id,
            attempt = job.attempt,
            phase = %job.phase,
            "Processing job"
        );
        Ok(true)
    }

    async fn attempt(
        &self,
        job: &mut EncodeJob,
        token: &str,
        abort: AbortSignal,
        pid_tx: watch::Sender<Option<i32>>,
    ) -> Attempt<ArtifactSet> {
        let (staged, output) = match job.phase {
            JobPhase::Encode => self.encode(job, abort.clone(), pid_tx).await?,
            JobPhase::Finalize => match (job.staged_dir.clone(), job.transcode_output.clone()) {
                (Some(staged), Some(output)) => (PathBuf::from(staged), output),
                _ => {
                    return Err(AttemptError::failed(
                        FailureKind::EngineFailure,
                        "finalize retry without staged output",
                    ))
                }
            },
        };

        let pending_abort = *abort.borrow();
        if let Some(reason) = pending_abort {
            // A staged output from an earlier attempt stays recorded on the job
            if job.phase == JobPhase::Encode {
                self.discard(&staged).await;
            }
            return Err(AttemptError::Aborted(reason));
        }

        let now = self.deps.time_provider.now_millis();
        job.begin_finalize(staged.to_string_lossy(), output.clone(), now)?;
        if !self.deps.queue.persist(job, token).await? {
            self.discard(&staged).await;
            return Err(AttemptError::Aborted(AbortReason::ClaimLost));
        }

        if let Some(reason) = *abort.borrow() {
            return Err(AttemptError::Aborted(reason));
        }

        self.deps
            .artifacts
            .publish(&job.clip_id, &staged, &output, now)
            .await
            .map_err(|e| AttemptError::failed(FailureKind::StorageWriteFailure, e))
    }

    /// Transcode into a fresh staging directory
    async fn encode(
        &self,
        job: &EncodeJob,
        abort: AbortSignal,
        pid_tx: watch::Sender<Option<i32>>,
    ) -> Attempt<(PathBuf, TranscodeOutput)> {
        let source = self
            .deps
            .artifacts
            .source_path(&job.clip_id)
            .await
            .map_err(|e| AttemptError::failed(FailureKind::SourceUnavailable, e))?;

        let staged = self
            .deps
            .artifacts
            .stage_output(&job.clip_id, job.attempt)
            .await
            .map_err(|e| AttemptError::failed(FailureKind::StorageWriteFailure, e))?;

        let writer = Arc::new(self.deps.progress.writer(job.clip_id.clone(), job.attempt));
        writer.start();

        let request = TranscodeRequest {
            clip_id: job.clip_id.clone(),
            source,
            sink: staged.clone(),
            on_progress: writer.into_callback(),
            abort,
            pid_sink: Some(pid_tx),
        };

        debug!(job_id = %job.id, staged = %staged.display(), "Transcoding");
        let transcoder = Arc::clone(&self.deps.transcoder);
        let result = execute_guarded(async move { transcoder.transcode(request).await }).await;

        let err = match result {
            PanicGuardResult::Success(Ok(output)) => return Ok((staged, output)),
            PanicGuardResult::Success(Err(TranscodeError::Aborted(reason))) => {
                AttemptError::Aborted(reason)
            }
            PanicGuardResult::Success(Err(e)) => {
                AttemptError::failed(e.failure_kind().unwrap_or(FailureKind::EngineFailure), e)
            }
            PanicGuardResult::Panicked(msg) => AttemptError::failed(
                FailureKind::EngineFailure,
                format!("transcoder panicked: {}", msg),
            ),
        };

        self.discard(&staged).await;
        Err(err)
    }

    async fn finish(&self, job: &mut EncodeJob, token: &str, artifacts: ArtifactSet) -> Result<()> {
        let clip_id = job.clip_id.clone();
        let now = self.deps.time_provider.now_millis();

        self.deps.progress.writer(clip_id.clone(), job.attempt).complete();

        match self.deps.clips.set_state(&clip_id, ClipState::Ready, now).await {
            Ok(()) | Err(AppError::ClipSettled { state: ClipState::Ready, .. }) => {}
            Err(AppError::NotFound(_)) => {
                info!(clip_id = %clip_id, "Clip deleted during publication, removing outputs");
                self.purge_outputs(&clip_id).await;
                return self.drop_job(job, token).await;
            }
            Err(AppError::ClipSettled { state, .. }) => {
                warn!(clip_id = %clip_id, state = %state, "Clip settled during publication, removing outputs");
                self.purge_outputs(&clip_id).await;
                self.deps.progress.mark_failed(&clip_id);
                return self.close_for_settled_clip(job, token, state).await;
            }
            Err(e) => return Err(e),
        }

        if !self.deps.queue.complete(job).await? {
            warn!(job_id = %job.id, "Published, but the claim was revoked before completion");
        }
        self.deps.progress.clear(&clip_id);

        if let Err(e) = self.deps.artifacts.delete_source(&clip_id).await {
            warn!(clip_id = %clip_id, error = %e, "Failed to delete source after publication");
        }

        info!(
            job_id = %job.id,
            clip_id = %clip_id,
            attempt = job.attempt,
            renditions = artifacts.renditions.len(),
            "Clip ready"
        );
        Ok(())
    }

    async fn settle_failure(&self, job: &mut EncodeJob, token: &str, err: AttemptError) -> Result<()> {
        match err {
            AttemptError::Internal(e) => {
                // Claim is left to expire; recovery picks the job up again
                error!(job_id = %job.id, error = %e, "Internal error during attempt");
                Err(e)
            }
            AttemptError::Aborted(AbortReason::ClipDeleted) => {
                info!(job_id = %job.id, clip_id = %job.clip_id, "Encode aborted, clip deleted");
                let clip_id = job.clip_id.clone();
                self.drop_job(job, token).await?;
                self.purge_outputs(&clip_id).await;
                if let Err(e) = self.deps.artifacts.delete_source(&clip_id).await {
                    warn!(clip_id = %clip_id, error = %e, "Failed to delete source");
                }
                Ok(())
            }
            AttemptError::Aborted(AbortReason::Shutdown) => {
                info!(job_id = %job.id, "Encode interrupted by shutdown, releasing job");
                self.deps.queue.release(job).await?;
                Ok(())
            }
            AttemptError::Aborted(AbortReason::ClaimLost) => {
                warn!(job_id = %job.id, "Claim lost, abandoning attempt");
                if let Some(staged) = job.staged_dir.clone() {
                    self.discard(Path::new(&staged)).await;
                }
                Ok(())
            }
            AttemptError::Failed { kind, message } => {
                warn!(
                    job_id = %job.id,
                    clip_id = %job.clip_id,
                    attempt = job.attempt,
                    failure = %kind,
                    error = %message,
                    "Attempt failed"
                );
                match self.retry_policy.decide(job, kind) {
                    RetryDecision::Retry(delay_ms) => {
                        let staged = job.staged_dir.clone();
                        if self.deps.queue.requeue(job, kind, &message, delay_ms).await? {
                            if let Some(staged) = staged {
                                self.discard(Path::new(&staged)).await;
                            }
                        }
                    }
                    RetryDecision::RetryFinalize(delay_ms) => {
                        self.deps.queue.requeue_finalize(job, &message, delay_ms).await?;
                    }
                    RetryDecision::Failed => self.fail_permanently(job, token, kind, message).await?,
                }
                Ok(())
            }
        }
    }

    async fn fail_permanently(
        &self,
        job: &mut EncodeJob,
        token: &str,
        kind: FailureKind,
        message: String,
    ) -> Result<()> {
        let clip_id = job.clip_id.clone();
        let staged = job.staged_dir.clone();
        let now = self.deps.time_provider.now_millis();

        job.fail(kind, message, now)?;
        if !self.deps.queue.persist(job, token).await? {
            return Ok(());
        }

        match self.deps.clips.set_state(&clip_id, ClipState::Failed, now).await {
            Ok(()) | Err(AppError::NotFound(_)) | Err(AppError::ClipSettled { .. }) => {}
            Err(e) => return Err(e),
        }
        self.deps.progress.mark_failed(&clip_id);

        if let Some(staged) = staged {
            self.discard(Path::new(&staged)).await;
        }
        self.purge_outputs(&clip_id).await;
        if let Err(e) = self.deps.artifacts.delete_source(&clip_id).await {
            warn!(clip_id = %clip_id, error = %e, "Failed to delete source");
        }

        error!(
            job_id = %job.id,
            clip_id = %clip_id,
            attempt = job.attempt,
            failure = %kind,
            "Clip failed permanently"
        );
        Ok(())
    }

    /// Cancel the job of a clip that no longer exists
    async fn drop_job(&self, job: &mut EncodeJob, token: &str) -> Result<()> {
        let staged = job.staged_dir.clone();
        job.cancel(self.deps.time_provider.now_millis())?;
        self.deps.queue.persist(job, token).await?;
        self.deps.progress.clear(&job.clip_id);
        if let Some(staged) = staged {
            self.discard(Path::new(&staged)).await;
        }
        Ok(())
    }

    /// Close a job whose clip already reached Ready or Failed
    async fn close_for_settled_clip(
        &self,
        job: &mut EncodeJob,
        token: &str,
        state: ClipState,
    ) -> Result<()> {
        if state == ClipState::Ready {
            info!(job_id = %job.id, clip_id = %job.clip_id, "Clip already ready, closing job");
            return self.close_published(job, token).await;
        }
        let staged = job.staged_dir.clone();
        let kind = job.failure.unwrap_or(FailureKind::WorkerCrash);
        job.fail(kind, "clip already failed", self.deps.time_provider.now_millis())?;
        self.deps.queue.persist(job, token).await?;
        if let Some(staged) = staged {
            self.discard(Path::new(&staged)).await;
        }
        Ok(())
    }

    /// The clip was published by an earlier claim that died before closing its job
    async fn close_published(&self, job: &mut EncodeJob, token: &str) -> Result<()> {
        let now = self.deps.time_provider.now_millis();
        let staged = job.staged_dir.clone();
        match (staged.clone(), job.transcode_output.clone()) {
            (Some(dir), Some(output)) => {
                job.begin_finalize(dir, output, now)?;
                job.complete(now)?;
            }
            _ => job.cancel(now)?,
        }
        self.deps.queue.persist(job, token).await?;
        self.deps.progress.clear(&job.clip_id);
        if let Some(staged) = staged {
            self.discard(Path::new(&staged)).await;
        }
        Ok(())
    }

    async fn discard(&self, staged: &Path) {
        if let Err(e) = self.deps.artifacts.discard_staged(staged).await {
            warn!(staged = %staged.display(), error = %e, "Failed to discard staged output");
        }
    }

    async fn purge_outputs(&self, clip_id: &str) {
        if let Err(e) = self.deps.artifacts.delete_outputs(&clip_id.to_string()).await {
            warn!(clip_id = %clip_id, error = %e, "Failed to delete outputs");
        }
    }
}
