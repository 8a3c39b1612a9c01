// SQLite JobQueue Implementation

use crate::error::{is_unique_violation, map_sqlx_error};
use async_trait::async_trait;
use clipcast_core::domain::{ClipId, EncodeJob, FailureKind, JobId, JobPhase, JobState, TranscodeOutput};
use clipcast_core::error::{AppError, Result};
use clipcast_core::port::JobQueue;
use sqlx::SqlitePool;
use std::str::FromStr;

const LIVE_STATES: &str = "('QUEUED', 'CLAIMED', 'RUNNING', 'FINALIZING')";
const CLAIMED_STATES: &str = "('CLAIMED', 'RUNNING', 'FINALIZING')";

pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn insert(&self, job: &EncodeJob) -> Result<()> {
        let output = encode_output(job.transcode_output.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO encode_jobs (
                id, clip_id, state, phase,
                enqueued_at, available_at, claimed_at, heartbeat_at, finished_at,
                attempt, max_attempts, finalize_attempts,
                claim_token, worker_id, pid,
                staged_dir, transcode_output, failure, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.clip_id)
        .bind(job.state.as_str())
        .bind(job.phase.as_str())
        .bind(job.enqueued_at)
        .bind(job.available_at)
        .bind(job.claimed_at)
        .bind(job.heartbeat_at)
        .bind(job.finished_at)
        .bind(job.attempt)
        .bind(job.max_attempts)
        .bind(job.finalize_attempts)
        .bind(&job.claim_token)
        .bind(&job.worker_id)
        .bind(job.pid)
        .bind(&job.staged_dir)
        .bind(&output)
        .bind(job.failure.map(|f| f.as_str()))
        .bind(&job.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // The partial unique index rejects a second live job for the clip
            if is_unique_violation(&e) {
                AppError::DuplicateJob(job.clip_id.clone())
            } else {
                map_sqlx_error(e)
            }
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<EncodeJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM encode_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn find_live_by_clip(&self, clip_id: &ClipId) -> Result<Option<EncodeJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT * FROM encode_jobs WHERE clip_id = ? AND state IN {} LIMIT 1",
            LIVE_STATES
        ))
        .bind(clip_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        claim_token: &str,
        now: i64,
    ) -> Result<Option<EncodeJob>> {
        // Single statement: the subquery pick and the state flip are atomic,
        // and the outer state check makes a lost race a no-op.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE encode_jobs
            SET state = 'CLAIMED', claim_token = ?, worker_id = ?, claimed_at = ?, heartbeat_at = ?
            WHERE id = (
                SELECT id FROM encode_jobs
                WHERE state = 'QUEUED' AND available_at <= ?
                ORDER BY enqueued_at ASC, id ASC
                LIMIT 1
            )
              AND state = 'QUEUED'
            RETURNING *
            "#,
        )
        .bind(claim_token)
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn update_claimed(&self, job: &EncodeJob, claim_token: &str) -> Result<bool> {
        let output = encode_output(job.transcode_output.as_ref())?;

        let result = sqlx::query(
            r#"
            UPDATE encode_jobs
            SET state = ?, phase = ?, available_at = ?,
                claimed_at = ?, heartbeat_at = ?, finished_at = ?,
                attempt = ?, finalize_attempts = ?,
                claim_token = ?, worker_id = ?, pid = ?,
                staged_dir = ?, transcode_output = ?, failure = ?, last_error = ?
            WHERE id = ? AND claim_token = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(job.phase.as_str())
        .bind(job.available_at)
        .bind(job.claimed_at)
        .bind(job.heartbeat_at)
        .bind(job.finished_at)
        .bind(job.attempt)
        .bind(job.finalize_attempts)
        .bind(&job.claim_token)
        .bind(&job.worker_id)
        .bind(job.pid)
        .bind(&job.staged_dir)
        .bind(&output)
        .bind(job.failure.map(|f| f.as_str()))
        .bind(&job.last_error)
        .bind(&job.id)
        .bind(claim_token)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(
        &self,
        id: &JobId,
        claim_token: &str,
        now: i64,
        pid: Option<i32>,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE encode_jobs SET heartbeat_at = ?, pid = ? \
             WHERE id = ? AND claim_token = ? AND state IN {}",
            CLAIMED_STATES
        ))
        .bind(now)
        .bind(pid)
        .bind(id)
        .bind(claim_token)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_queued(&self, clip_id: &ClipId, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE encode_jobs
            SET state = 'CANCELLED', finished_at = ?
            WHERE clip_id = ? AND state = 'QUEUED'
            "#,
        )
        .bind(now)
        .bind(clip_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale(&self, cutoff: i64) -> Result<Vec<EncodeJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT * FROM encode_jobs \
             WHERE state IN {} AND COALESCE(heartbeat_at, claimed_at, 0) < ? \
             ORDER BY enqueued_at ASC",
            CLAIMED_STATES
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn find_by_state(&self, state: JobState) -> Result<Vec<EncodeJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM encode_jobs
            WHERE state = ?
            ORDER BY enqueued_at ASC, id ASC
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }
}

fn encode_output(output: Option<&TranscodeOutput>) -> Result<Option<String>> {
    output
        .map(serde_json::to_string)
        .transpose()
        .map_err(AppError::from)
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    clip_id: String,
    state: String,
    phase: String,

    enqueued_at: i64,
    available_at: i64,
    claimed_at: Option<i64>,
    heartbeat_at: Option<i64>,
    finished_at: Option<i64>,

    attempt: i32,
    max_attempts: i32,
    finalize_attempts: i32,

    claim_token: Option<String>,
    worker_id: Option<String>,
    pid: Option<i32>,

    staged_dir: Option<String>,
    transcode_output: Option<String>,
    failure: Option<String>,
    last_error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<EncodeJob> {
        let transcode_output = self
            .transcode_output
            .as_deref()
            .map(serde_json::from_str::<TranscodeOutput>)
            .transpose()?;

        let failure = self
            .failure
            .as_deref()
            .map(FailureKind::from_str)
            .transpose()?;

        Ok(EncodeJob {
            id: self.id,
            clip_id: self.clip_id,
            state: JobState::from_str(&self.state)?,
            phase: JobPhase::from_str(&self.phase)?,
            enqueued_at: self.enqueued_at,
            available_at: self.available_at,
            claimed_at: self.claimed_at,
            heartbeat_at: self.heartbeat_at,
            finished_at: self.finished_at,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            finalize_attempts: self.finalize_attempts,
            claim_token: self.claim_token,
            worker_id: self.worker_id,
            pid: self.pid,
            staged_dir: self.staged_dir,
            transcode_output,
            failure,
            last_error: self.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use clipcast_core::domain::Rendition;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn setup_test_db() -> SqliteJobQueue {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteJobQueue::new(pool)
    }

    fn output() -> TranscodeOutput {
        TranscodeOutput {
            manifest: "manifest.mpd".to_string(),
            renditions: vec![Rendition {
                index: 0,
                width: 1280,
                height: 720,
                fps: 30,
                bitrate_kbps: 2000,
                init_segment: "init-0.m4s".to_string(),
                segments: vec!["chunk-0-00001.m4s".to_string()],
            }],
            audio: None,
            thumbnail: "thumbnail.jpg".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = setup_test_db().await;
        let job = EncodeJob::new("job-1", "clip-1", 100, 2);
        repo.insert(&job).await.unwrap();

        let found = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert_eq!(
            repo.find_live_by_clip(&"clip-1".to_string()).await.unwrap().unwrap().id,
            "job-1"
        );
    }

    #[tokio::test]
    async fn test_second_live_job_is_duplicate() {
        let repo = setup_test_db().await;
        repo.insert(&EncodeJob::new("job-1", "clip-1", 100, 2)).await.unwrap();

        let err = repo
            .insert(&EncodeJob::new("job-2", "clip-1", 200, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateJob(clip) if clip == "clip-1"));

        // Once the first job is finished the clip may be queued again
        assert!(repo.cancel_queued(&"clip-1".to_string(), 300).await.unwrap());
        repo.insert(&EncodeJob::new("job-3", "clip-1", 400, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_respects_backoff() {
        let repo = setup_test_db().await;
        let mut delayed = EncodeJob::new("job-a", "a", 100, 2);
        delayed.available_at = 10_000;
        repo.insert(&delayed).await.unwrap();
        repo.insert(&EncodeJob::new("job-b", "b", 200, 2)).await.unwrap();
        repo.insert(&EncodeJob::new("job-c", "c", 300, 2)).await.unwrap();

        let first = repo.claim_next("w1", "t1", 1_000).await.unwrap().unwrap();
        assert_eq!(first.id, "job-b");
        assert_eq!(first.state, JobState::Claimed);
        assert_eq!(first.claim_token.as_deref(), Some("t1"));
        assert_eq!(first.heartbeat_at, Some(1_000));

        let second = repo.claim_next("w2", "t2", 1_000).await.unwrap().unwrap();
        assert_eq!(second.id, "job-c");
        assert!(repo.claim_next("w3", "t3", 1_000).await.unwrap().is_none());

        let third = repo.claim_next("w3", "t3", 10_000).await.unwrap().unwrap();
        assert_eq!(third.id, "job-a");
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqliteJobQueue::new(pool));

        for i in 0..20 {
            repo.insert(&EncodeJob::new(format!("job-{}", i), format!("clip-{}", i), i, 2))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = repo
                    .claim_next(&format!("w{}", w), &format!("t{}", w), 1_000)
                    .await
                    .unwrap()
                {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_update_requires_current_claim_token() {
        let repo = setup_test_db().await;
        repo.insert(&EncodeJob::new("job-1", "clip-1", 100, 2)).await.unwrap();
        let mut job = repo.claim_next("w1", "t1", 1_000).await.unwrap().unwrap();

        job.start(1_100).unwrap();
        job.begin_finalize("/staging/clip-1.1.x", output(), 1_200).unwrap();
        assert!(repo.update_claimed(&job, "t1").await.unwrap());
        assert!(!repo.update_claimed(&job, "stale").await.unwrap());

        let stored = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Finalizing);
        assert_eq!(stored.phase, JobPhase::Finalize);
        assert_eq!(stored.transcode_output, Some(output()));

        // Releasing clears the token; the old token is now dead
        job.requeue_for_finalize("rename failed", 2_000).unwrap();
        assert!(repo.update_claimed(&job, "t1").await.unwrap());
        assert!(!repo.heartbeat(&job.id, "t1", 2_100, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_and_stale_detection() {
        let repo = setup_test_db().await;
        repo.insert(&EncodeJob::new("job-1", "clip-1", 100, 2)).await.unwrap();
        repo.insert(&EncodeJob::new("job-2", "clip-2", 200, 2)).await.unwrap();
        repo.claim_next("w1", "t1", 1_000).await.unwrap().unwrap();
        repo.claim_next("w2", "t2", 1_000).await.unwrap().unwrap();

        assert!(repo.heartbeat(&"job-2".to_string(), "t2", 5_000, Some(77)).await.unwrap());

        let stale = repo.find_stale(3_000).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "job-1");

        let fresh = repo.find_by_id(&"job-2".to_string()).await.unwrap().unwrap();
        assert_eq!(fresh.pid, Some(77));
    }

    #[tokio::test]
    async fn test_cancel_queued_skips_claimed() {
        let repo = setup_test_db().await;
        repo.insert(&EncodeJob::new("job-1", "clip-1", 100, 2)).await.unwrap();
        repo.claim_next("w1", "t1", 1_000).await.unwrap().unwrap();

        assert!(!repo.cancel_queued(&"clip-1".to_string(), 2_000).await.unwrap());
        assert_eq!(repo.find_by_state(JobState::Claimed).await.unwrap().len(), 1);
    }
}
