// Job Queue Port (Interface)

use crate::domain::{ClipId, EncodeJob, JobId, JobState};
use crate::error::Result;
use async_trait::async_trait;

/// Durable storage for encode jobs.
///
/// Every write made by a worker is conditional on the claim token it was
/// handed by [`JobQueue::claim_next`]. Once recovery revokes a claim, writes
/// carrying the old token are rejected.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new job
    ///
    /// # Errors
    /// `AppError::DuplicateJob` if the clip already has a live job
    async fn insert(&self, job: &EncodeJob) -> Result<()>;

    /// Find job by ID
    async fn find_by_id(&self, id: &JobId) -> Result<Option<EncodeJob>>;

    /// Find the live (queued or claimed) job for a clip, if any
    async fn find_live_by_clip(&self, clip_id: &ClipId) -> Result<Option<EncodeJob>>;

    /// Atomically claim the oldest available job (FIFO by `enqueued_at`).
    ///
    /// Only jobs with `available_at <= now` are eligible. Concurrent callers
    /// never receive the same job.
    async fn claim_next(&self, worker_id: &str, claim_token: &str, now: i64)
        -> Result<Option<EncodeJob>>;

    /// Persist a job the caller holds a claim on.
    ///
    /// Returns `false` (and writes nothing) if the stored claim token no longer
    /// matches `claim_token`.
    async fn update_claimed(&self, job: &EncodeJob, claim_token: &str) -> Result<bool>;

    /// Refresh the liveness timestamp (and subprocess pid) of a claimed job.
    ///
    /// Returns `false` if the claim was revoked.
    async fn heartbeat(
        &self,
        id: &JobId,
        claim_token: &str,
        now: i64,
        pid: Option<i32>,
    ) -> Result<bool>;

    /// Cancel the clip's job if it is still waiting in the queue
    async fn cancel_queued(&self, clip_id: &ClipId, now: i64) -> Result<bool>;

    /// Claimed jobs whose last heartbeat is older than `cutoff`
    async fn find_stale(&self, cutoff: i64) -> Result<Vec<EncodeJob>>;

    /// Find all jobs by state
    async fn find_by_state(&self, state: JobState) -> Result<Vec<EncodeJob>>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory job queue with the same claim semantics as the durable one
    #[derive(Default)]
    pub struct InMemoryJobQueue {
        jobs: Mutex<HashMap<JobId, EncodeJob>>,
    }

    impl InMemoryJobQueue {
        pub fn new() -> Self {
            Self::default()
        }

        /// Overwrite a job regardless of its claim (test setup only)
        pub fn put(&self, job: EncodeJob) {
            self.jobs.lock().unwrap().insert(job.id.clone(), job);
        }

        pub fn all(&self) -> Vec<EncodeJob> {
            self.jobs.lock().unwrap().values().cloned().collect()
        }
    }

    #[async_trait]
    impl JobQueue for InMemoryJobQueue {
        async fn insert(&self, job: &EncodeJob) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs
                .values()
                .any(|j| j.clip_id == job.clip_id && j.is_live())
            {
                return Err(AppError::DuplicateJob(job.clip_id.clone()));
            }
            jobs.insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<EncodeJob>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn find_live_by_clip(&self, clip_id: &ClipId) -> Result<Option<EncodeJob>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .find(|j| &j.clip_id == clip_id && j.is_live())
                .cloned())
        }

        async fn claim_next(
            &self,
            worker_id: &str,
            claim_token: &str,
            now: i64,
        ) -> Result<Option<EncodeJob>> {
            let mut jobs = self.jobs.lock().unwrap();
            let next = jobs
                .values_mut()
                .filter(|j| j.state == JobState::Queued && j.available_at <= now)
                .min_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));

            Ok(next.map(|job| {
                job.state = JobState::Claimed;
                job.claim_token = Some(claim_token.to_string());
                job.worker_id = Some(worker_id.to_string());
                job.claimed_at = Some(now);
                job.heartbeat_at = Some(now);
                job.clone()
            }))
        }

        async fn update_claimed(&self, job: &EncodeJob, claim_token: &str) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(&job.id) {
                Some(stored) if stored.claim_token.as_deref() == Some(claim_token) => {
                    *stored = job.clone();
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn heartbeat(
            &self,
            id: &JobId,
            claim_token: &str,
            now: i64,
            pid: Option<i32>,
        ) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(id) {
                Some(stored) if stored.claim_token.as_deref() == Some(claim_token) => {
                    stored.heartbeat_at = Some(now);
                    stored.pid = pid;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn cancel_queued(&self, clip_id: &ClipId, now: i64) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs
                .values_mut()
                .find(|j| &j.clip_id == clip_id && j.state == JobState::Queued)
            {
                Some(job) => {
                    job.cancel(now)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn find_stale(&self, cutoff: i64) -> Result<Vec<EncodeJob>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| j.state.is_claimed() && j.heartbeat_at.unwrap_or(0) < cutoff)
                .cloned()
                .collect())
        }

        async fn find_by_state(&self, state: JobState) -> Result<Vec<EncodeJob>> {
            let mut found: Vec<EncodeJob> = self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| j.state == state)
                .cloned()
                .collect();
            found.sort_by_key(|j| j.enqueued_at);
            Ok(found)
        }
    }
}
