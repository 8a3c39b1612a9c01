//! Housekeeping port for the encode-job database.
//!
//! Settled jobs stay in the table so `clips.status.v1` can still explain a
//! failure. Each settled state has its own retention window, counted from
//! the job's `finished_at`.

use crate::domain::JobState;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Days a settled job is kept after it finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub done_days: i64,
    /// Failed jobs carry the failure kind and the engine's stderr tail
    pub failed_days: i64,
    pub cancelled_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            done_days: 7,
            failed_days: 30,
            cancelled_days: 1,
        }
    }
}

impl RetentionPolicy {
    /// Same window for every settled state
    pub fn uniform(days: i64) -> Self {
        Self {
            done_days: days,
            failed_days: days,
            cancelled_days: days,
        }
    }

    /// Retention for `state`; live states are never purged
    pub fn days_for(&self, state: JobState) -> Option<i64> {
        match state {
            JobState::Done => Some(self.done_days),
            JobState::Failed => Some(self.failed_days),
            JobState::Cancelled => Some(self.cancelled_days),
            _ => None,
        }
    }

    /// `finished_at` cutoff per settled state, as seen at `now`
    pub fn cutoffs(&self, now: i64) -> Vec<(JobState, i64)> {
        JobState::SETTLED
            .iter()
            .filter_map(|&state| {
                self.days_for(state)
                    .map(|days| (state, now - days * MS_PER_DAY))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.done_days < 0 || self.failed_days < 0 || self.cancelled_days < 0 {
            return Err(AppError::Validation(
                "retention days must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Encode jobs per state; `in_flight` covers Claimed, Running and Finalizing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: i64,
    pub in_flight: i64,
    pub done: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, n: i64) {
        match state {
            JobState::Queued => self.queued += n,
            JobState::Claimed | JobState::Running | JobState::Finalizing => self.in_flight += n,
            JobState::Done => self.done += n,
            JobState::Failed => self.failed += n,
            JobState::Cancelled => self.cancelled += n,
        }
    }

    pub fn settled(&self) -> i64 {
        self.done + self.failed + self.cancelled
    }

    pub fn total(&self) -> i64 {
        self.queued + self.in_flight + self.settled()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub size_bytes: i64,
    /// Bytes on the freelist, reclaimable by `compact`
    pub free_bytes: i64,
    pub jobs: JobCounts,
    pub clips: i64,
}

#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Delete jobs in `state` that finished before `finished_before`
    ///
    /// # Errors
    /// - `AppError::Validation` if `state` is live
    async fn purge_settled(&self, state: JobState, finished_before: i64) -> Result<u64>;

    /// Rebuild the database file, returning the bytes reclaimed
    async fn compact(&self) -> Result<i64>;

    async fn stats(&self) -> Result<StoreStats>;
}
