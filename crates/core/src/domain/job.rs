// Encode Job Domain Model

use crate::domain::artifact::TranscodeOutput;
use crate::domain::clip::ClipId;
use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job ID (UUID v4)
pub type JobId = String;

/// Job lifecycle state
///
/// `Queued`, `Claimed`, `Running` and `Finalizing` are "live": at most one live
/// job exists per clip. `Done`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Claimed,
    Running,
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub const LIVE: [JobState; 4] = [
        JobState::Queued,
        JobState::Claimed,
        JobState::Running,
        JobState::Finalizing,
    ];

    pub const SETTLED: [JobState; 3] = [JobState::Done, JobState::Failed, JobState::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Claimed => "CLAIMED",
            JobState::Running => "RUNNING",
            JobState::Finalizing => "FINALIZING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    /// Held by a worker (claim token is set)
    pub fn is_claimed(&self) -> bool {
        matches!(
            self,
            JobState::Claimed | JobState::Running | JobState::Finalizing
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "CLAIMED" => Ok(JobState::Claimed),
            "RUNNING" => Ok(JobState::Running),
            "FINALIZING" => Ok(JobState::Finalizing),
            "DONE" => Ok(JobState::Done),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(DomainError::UnknownVariant {
                kind: "job state",
                value: other.to_string(),
            }),
        }
    }
}

/// Which part of the work the next claim has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    /// Transcode from the source, then publish
    Encode,
    /// Output is already staged, only publish it
    Finalize,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Encode => "ENCODE",
            JobPhase::Finalize => "FINALIZE",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPhase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ENCODE" => Ok(JobPhase::Encode),
            "FINALIZE" => Ok(JobPhase::Finalize),
            other => Err(DomainError::UnknownVariant {
                kind: "job phase",
                value: other.to_string(),
            }),
        }
    }
}

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Source file missing or unreadable. Never retried.
    SourceUnavailable,
    /// Transcoder exited non-zero, panicked or produced no output
    EngineFailure,
    /// Claim went stale (worker died or hung)
    WorkerCrash,
    /// Publishing the staged output failed. Retried as finalize-only.
    StorageWriteFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
            FailureKind::EngineFailure => "ENGINE_FAILURE",
            FailureKind::WorkerCrash => "WORKER_CRASH",
            FailureKind::StorageWriteFailure => "STORAGE_WRITE_FAILURE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::SourceUnavailable)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SOURCE_UNAVAILABLE" => Ok(FailureKind::SourceUnavailable),
            "ENGINE_FAILURE" => Ok(FailureKind::EngineFailure),
            "WORKER_CRASH" => Ok(FailureKind::WorkerCrash),
            "STORAGE_WRITE_FAILURE" => Ok(FailureKind::StorageWriteFailure),
            other => Err(DomainError::UnknownVariant {
                kind: "failure kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Encode job entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeJob {
    pub id: JobId,
    pub clip_id: ClipId,
    pub state: JobState,
    pub phase: JobPhase,

    pub enqueued_at: i64,  // epoch ms, FIFO key
    pub available_at: i64, // epoch ms, retry backoff gate
    pub claimed_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    pub finished_at: Option<i64>,

    /// Current attempt number, starting at 1
    pub attempt: i32,
    pub max_attempts: i32,
    pub finalize_attempts: i32,

    // Claim identity
    pub claim_token: Option<String>,
    pub worker_id: Option<String>,
    pub pid: Option<i32>,

    // Staged output awaiting publication
    pub staged_dir: Option<String>,
    pub transcode_output: Option<TranscodeOutput>,

    pub failure: Option<FailureKind>,
    pub last_error: Option<String>,
}

impl EncodeJob {
    /// Create a new queued job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique job ID (injected, not generated)
    /// * `clip_id` - Clip this job encodes
    /// * `enqueued_at` - Enqueue timestamp in epoch ms (injected, not system time)
    /// * `max_attempts` - Attempt ceiling, including the first attempt
    pub fn new(
        id: impl Into<String>,
        clip_id: impl Into<String>,
        enqueued_at: i64,
        max_attempts: i32,
    ) -> Self {
        Self {
            id: id.into(),
            clip_id: clip_id.into(),
            state: JobState::Queued,
            phase: JobPhase::Encode,
            enqueued_at,
            available_at: enqueued_at,
            claimed_at: None,
            heartbeat_at: None,
            finished_at: None,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            finalize_attempts: 0,
            claim_token: None,
            worker_id: None,
            pid: None,
            staged_dir: None,
            transcode_output: None,
            failure: None,
            last_error: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    fn invalid(&self, to: JobState) -> DomainError {
        DomainError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    /// Claimed -> Running
    pub fn start(&mut self, now_millis: i64) -> Result<()> {
        if self.state != JobState::Claimed {
            return Err(self.invalid(JobState::Running));
        }
        self.state = JobState::Running;
        self.heartbeat_at = Some(now_millis);
        Ok(())
    }

    /// Running (or Claimed, for a finalize-only retry) -> Finalizing
    pub fn begin_finalize(
        &mut self,
        staged_dir: impl Into<String>,
        output: TranscodeOutput,
        now_millis: i64,
    ) -> Result<()> {
        if !matches!(self.state, JobState::Running | JobState::Claimed) {
            return Err(self.invalid(JobState::Finalizing));
        }
        self.state = JobState::Finalizing;
        self.phase = JobPhase::Finalize;
        self.staged_dir = Some(staged_dir.into());
        self.transcode_output = Some(output);
        self.pid = None;
        self.heartbeat_at = Some(now_millis);
        Ok(())
    }

    /// Finalizing -> Done
    pub fn complete(&mut self, now_millis: i64) -> Result<()> {
        if self.state != JobState::Finalizing {
            return Err(self.invalid(JobState::Done));
        }
        self.state = JobState::Done;
        self.finished_at = Some(now_millis);
        self.pid = None;
        self.staged_dir = None;
        Ok(())
    }

    /// Any live state -> Failed
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>, now_millis: i64) -> Result<()> {
        if !self.is_live() {
            return Err(self.invalid(JobState::Failed));
        }
        self.state = JobState::Failed;
        self.failure = Some(kind);
        self.last_error = Some(message.into());
        self.finished_at = Some(now_millis);
        self.pid = None;
        self.staged_dir = None;
        self.transcode_output = None;
        Ok(())
    }

    /// Any live state -> Cancelled
    pub fn cancel(&mut self, now_millis: i64) -> Result<()> {
        if !self.is_live() {
            return Err(self.invalid(JobState::Cancelled));
        }
        self.state = JobState::Cancelled;
        self.finished_at = Some(now_millis);
        self.pid = None;
        self.staged_dir = None;
        self.transcode_output = None;
        Ok(())
    }

    /// Requeue for a fresh attempt: consumes an attempt and drops any staged output
    pub fn requeue_for_retry(
        &mut self,
        kind: FailureKind,
        message: impl Into<String>,
        available_at: i64,
    ) -> Result<()> {
        self.release_claim(JobState::Queued)?;
        self.attempt += 1;
        self.phase = JobPhase::Encode;
        self.finalize_attempts = 0;
        self.staged_dir = None;
        self.transcode_output = None;
        self.available_at = available_at;
        self.failure = Some(kind);
        self.last_error = Some(message.into());
        Ok(())
    }

    /// Requeue to publish the already staged output again
    pub fn requeue_for_finalize(&mut self, message: impl Into<String>, available_at: i64) -> Result<()> {
        if self.staged_dir.is_none() || self.transcode_output.is_none() {
            return Err(DomainError::InvalidStateTransition {
                from: format!("{} (nothing staged)", self.state),
                to: JobState::Queued.to_string(),
            });
        }
        self.release_claim(JobState::Queued)?;
        self.phase = JobPhase::Finalize;
        self.finalize_attempts += 1;
        self.available_at = available_at;
        self.failure = Some(FailureKind::StorageWriteFailure);
        self.last_error = Some(message.into());
        Ok(())
    }

    /// Hand the job back without consuming an attempt (worker shutdown)
    pub fn release(&mut self, now_millis: i64) -> Result<()> {
        self.release_claim(JobState::Queued)?;
        if self.phase == JobPhase::Encode {
            self.staged_dir = None;
            self.transcode_output = None;
        }
        self.available_at = now_millis;
        Ok(())
    }

    fn release_claim(&mut self, to: JobState) -> Result<()> {
        if !self.state.is_claimed() {
            return Err(self.invalid(to));
        }
        self.state = to;
        self.claim_token = None;
        self.worker_id = None;
        self.claimed_at = None;
        self.heartbeat_at = None;
        self.pid = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed_job() -> EncodeJob {
        let mut job = EncodeJob::new("job-1", "clip-1", 1_000, 2);
        job.state = JobState::Claimed;
        job.claim_token = Some("token".to_string());
        job.worker_id = Some("worker-0".to_string());
        job.claimed_at = Some(2_000);
        job.heartbeat_at = Some(2_000);
        job
    }

    fn sample_output() -> TranscodeOutput {
        TranscodeOutput {
            manifest: "manifest.mpd".to_string(),
            renditions: vec![],
            audio: None,
            thumbnail: "thumbnail.jpg".to_string(),
        }
    }

    #[test]
    fn test_new_job_defaults() {
        let job = EncodeJob::new("job-1", "clip-1", 1_000, 2);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.phase, JobPhase::Encode);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.available_at, 1_000);
        assert!(job.has_attempts_left());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = claimed_job();
        job.start(3_000).unwrap();
        assert_eq!(job.state, JobState::Running);

        job.begin_finalize("/staging/clip-1.1.x", sample_output(), 4_000)
            .unwrap();
        assert_eq!(job.state, JobState::Finalizing);
        assert_eq!(job.phase, JobPhase::Finalize);

        job.complete(5_000).unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.finished_at, Some(5_000));
    }

    #[test]
    fn test_cannot_complete_without_finalizing() {
        let mut job = claimed_job();
        job.start(3_000).unwrap();
        assert!(job.complete(4_000).is_err());
    }

    #[test]
    fn test_requeue_for_retry_consumes_attempt() {
        let mut job = claimed_job();
        job.start(3_000).unwrap();
        job.requeue_for_retry(FailureKind::EngineFailure, "exit 1", 9_000)
            .unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.available_at, 9_000);
        assert!(job.claim_token.is_none());
        assert!(!job.has_attempts_left());
        // FIFO key is kept
        assert_eq!(job.enqueued_at, 1_000);
    }

    #[test]
    fn test_requeue_for_finalize_keeps_staging() {
        let mut job = claimed_job();
        job.start(3_000).unwrap();
        job.begin_finalize("/staging/x", sample_output(), 4_000)
            .unwrap();
        job.requeue_for_finalize("rename failed", 6_000).unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.phase, JobPhase::Finalize);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.finalize_attempts, 1);
        assert_eq!(job.staged_dir.as_deref(), Some("/staging/x"));
    }

    #[test]
    fn test_requeue_for_finalize_requires_staged_output() {
        let mut job = claimed_job();
        job.start(3_000).unwrap();
        assert!(job.requeue_for_finalize("nothing there", 6_000).is_err());
    }

    #[test]
    fn test_release_keeps_attempt() {
        let mut job = claimed_job();
        job.start(3_000).unwrap();
        job.release(7_000).unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.available_at, 7_000);
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut job = claimed_job();
        job.cancel(3_000).unwrap();
        assert!(job.fail(FailureKind::EngineFailure, "late", 4_000).is_err());
        assert!(job.release(4_000).is_err());
        assert!(job.start(4_000).is_err());
    }

    #[test]
    fn test_enum_string_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Claimed,
            JobState::Running,
            JobState::Finalizing,
            JobState::Done,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(
            "STORAGE_WRITE_FAILURE".parse::<FailureKind>().unwrap(),
            FailureKind::StorageWriteFailure
        );
        assert!(!FailureKind::SourceUnavailable.is_retryable());
        assert!(FailureKind::WorkerCrash.is_retryable());
    }
}
