// Retry logic
use crate::domain::{EncodeJob, FailureKind};
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Encode again from scratch after the given delay (ms)
    Retry(i64),
    /// Publish the already staged output again after the given delay (ms)
    RetryFinalize(i64),
    /// Do not retry, job has failed permanently
    Failed,
}

/// Retry policy
///
/// Decides what happens to a job after a failure, based on:
/// - The failure kind (a missing source never heals)
/// - Current attempt count against the job's attempt ceiling
/// - Whether a complete output is already staged
pub struct RetryPolicy {
    base_delay_ms: i64,
    backoff_factor: f64,
    max_finalize_attempts: i32,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    /// * `base_delay_ms` - Base delay in milliseconds (default: 1000)
    /// * `max_finalize_attempts` - Publication retries allowed per staged output
    pub fn new(base_delay_ms: i64, max_finalize_attempts: i32) -> Self {
        Self {
            base_delay_ms,
            backoff_factor: 2.0,
            max_finalize_attempts,
        }
    }

    /// Determine what to do with a job that failed with `kind`
    ///
    /// Backoff formula:
    /// delay = base_delay * (backoff_factor ^ (n - 1)) * jitter
    /// where `n` is the attempt (or finalize attempt) about to start.
    pub fn decide(&self, job: &EncodeJob, kind: FailureKind) -> RetryDecision {
        if !kind.is_retryable() {
            warn!(
                job_id = %job.id,
                clip_id = %job.clip_id,
                failure = %kind.as_str(),
                "Failure is not retryable"
            );
            return RetryDecision::Failed;
        }

        if kind == FailureKind::StorageWriteFailure
            && job.staged_dir.is_some()
            && job.transcode_output.is_some()
        {
            if job.finalize_attempts < self.max_finalize_attempts {
                let delay_ms = self.backoff(job, job.finalize_attempts);
                info!(
                    job_id = %job.id,
                    finalize_attempt = job.finalize_attempts + 1,
                    delay_ms = %delay_ms,
                    "Scheduling finalize retry"
                );
                return RetryDecision::RetryFinalize(delay_ms);
            }
            warn!(
                job_id = %job.id,
                finalize_attempts = job.finalize_attempts,
                "Finalize retries exhausted, falling back to a full attempt"
            );
        }

        if !job.has_attempts_left() {
            warn!(
                job_id = %job.id,
                attempt = %job.attempt,
                max_attempts = %job.max_attempts,
                "Max retry attempts reached"
            );
            return RetryDecision::Failed;
        }

        let delay_ms = self.backoff(job, job.attempt - 1);

        info!(
            job_id = %job.id,
            attempt = %job.attempt,
            max_attempts = %job.max_attempts,
            delay_ms = %delay_ms,
            "Scheduling retry"
        );

        RetryDecision::Retry(delay_ms)
    }

    fn backoff(&self, job: &EncodeJob, exponent: i32) -> i64 {
        let base_delay_ms = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent.max(0));

        // ±10% jitter, deterministic per job id
        let jitter_seed = job.id.chars().map(|c| c as u32).sum::<u32>();
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0);

        (base_delay_ms * jitter_factor) as i64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1000, 3)
    }
}
