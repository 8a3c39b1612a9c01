// Encoding pipeline facade - the operations exposed to intake and pollers

use crate::application::cancel::CancellationRegistry;
use crate::application::progress::ProgressRegistry;
use crate::application::queue::JobQueueService;
use crate::domain::{
    validate_clip_id, ArtifactSet, ClipId, ClipState, EncodeJob, FailureKind, JobId, JobPhase,
    JobState,
};
use crate::error::{AppError, Result};
use crate::port::{AbortReason, ArtifactStore, ClipStore, TimeProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Upload intake hands a clip to the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub clip_id: ClipId,
    /// File to import as the clip's source. When absent the source must
    /// already be in the artifact store.
    #[serde(default)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub clip_id: ClipId,
    pub progress: i32,
}

/// Live job as shown to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub state: JobState,
    pub phase: JobPhase,
    pub attempt: i32,
    pub max_attempts: i32,
    pub failure: Option<FailureKind>,
    pub last_error: Option<String>,
}

impl From<EncodeJob> for JobSummary {
    fn from(job: EncodeJob) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            phase: job.phase,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            failure: job.failure,
            last_error: job.last_error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipStatus {
    pub clip_id: ClipId,
    pub state: Option<ClipState>,
    pub progress: Option<i32>,
    pub job: Option<JobSummary>,
    pub artifacts: Option<ArtifactSet>,
}

pub struct EncodingPipeline {
    queue: Arc<JobQueueService>,
    clips: Arc<dyn ClipStore>,
    artifacts: Arc<dyn ArtifactStore>,
    progress: Arc<ProgressRegistry>,
    cancellations: Arc<CancellationRegistry>,
    time_provider: Arc<dyn TimeProvider>,
}

impl EncodingPipeline {
    pub fn new(
        queue: Arc<JobQueueService>,
        clips: Arc<dyn ClipStore>,
        artifacts: Arc<dyn ArtifactStore>,
        progress: Arc<ProgressRegistry>,
        cancellations: Arc<CancellationRegistry>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            queue,
            clips,
            artifacts,
            progress,
            cancellations,
            time_provider,
        }
    }

    /// Accept an uploaded clip for encoding
    ///
    /// # Errors
    /// - `AppError::Domain` for a malformed clip id
    /// - `AppError::DuplicateJob` if the clip already has a live job
    /// - `AppError::ClipSettled` if the clip already reached Ready or Failed
    /// - `AppError::Storage` if the source cannot be imported
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt> {
        let clip_id = request.clip_id;
        validate_clip_id(&clip_id)?;

        if self.queue.store().find_live_by_clip(&clip_id).await?.is_some() {
            return Err(AppError::DuplicateJob(clip_id));
        }

        if let Some(state) = self.clips.get_state(&clip_id).await? {
            if state.is_terminal() {
                return Err(AppError::ClipSettled { clip_id, state });
            }
        }

        if let Some(path) = &request.source_path {
            self.artifacts.import_source(&clip_id, path).await?;
        }

        let now = self.time_provider.now_millis();
        self.clips.create_if_absent(&clip_id, now).await?;

        let job_id = self.queue.enqueue(&clip_id).await?;
        let progress = self.progress.peek(&clip_id).unwrap_or(crate::domain::PROGRESS_QUEUED);

        Ok(EnqueueReceipt {
            job_id,
            clip_id,
            progress,
        })
    }

    /// Progress of the tracked clips among `clip_ids`; untracked ids are absent
    pub fn progress(&self, clip_ids: &[ClipId]) -> HashMap<ClipId, i32> {
        self.progress.get(clip_ids)
    }

    /// Delete a clip: stop any in-flight encode, drop its queued job and
    /// remove everything stored for it.
    ///
    /// Returns `false` if nothing was known about the clip.
    pub async fn cancel(&self, clip_id: &ClipId) -> Result<bool> {
        validate_clip_id(clip_id)?;
        let now = self.time_provider.now_millis();

        // Record first: a worker that has not yet read the clip will see it gone
        let existed = self.clips.delete(clip_id).await?;
        let aborted = self.cancellations.abort(clip_id, AbortReason::ClipDeleted);
        let dequeued = self.queue.store().cancel_queued(clip_id, now).await?;
        let tracked = self.progress.clear(clip_id);

        if let Err(e) = self.artifacts.delete_outputs(clip_id).await {
            warn!(clip_id = %clip_id, error = %e, "Failed to delete outputs");
        }
        if !aborted {
            // An in-flight encode still reads its source; the worker removes it
            if let Err(e) = self.artifacts.delete_source(clip_id).await {
                warn!(clip_id = %clip_id, error = %e, "Failed to delete source");
            }
        }

        let cancelled = existed || aborted || dequeued || tracked;
        info!(
            clip_id = %clip_id,
            aborted_in_flight = aborted,
            dequeued = dequeued,
            cancelled = cancelled,
            "Clip cancelled"
        );
        Ok(cancelled)
    }

    pub async fn status(&self, clip_id: &ClipId) -> Result<ClipStatus> {
        validate_clip_id(clip_id)?;
        let state = self.clips.get_state(clip_id).await?;
        let job = self.queue.store().find_live_by_clip(clip_id).await?;
        let artifacts = match state {
            Some(ClipState::Ready) => self.artifacts.load_artifacts(clip_id).await?,
            _ => None,
        };

        Ok(ClipStatus {
            clip_id: clip_id.clone(),
            state,
            progress: self.progress.peek(clip_id),
            job: job.map(JobSummary::from),
            artifacts,
        })
    }
}
