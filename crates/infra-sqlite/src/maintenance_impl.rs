// Settled-job retention and file compaction for the SQLite store
use crate::error::map_sqlx_error;
use async_trait::async_trait;
use clipcast_core::domain::JobState;
use clipcast_core::error::{AppError, Result};
use clipcast_core::port::{JobCounts, Maintenance, StoreStats};
use sqlx::SqlitePool;
use tracing::{debug, info};

pub struct SqliteMaintenance {
    pool: SqlitePool,
}

impl SqliteMaintenance {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn pragma(&self, name: &str) -> Result<i64> {
        sqlx::query_scalar(&format!("PRAGMA {}", name))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn file_size(&self) -> Result<i64> {
        Ok(self.pragma("page_count").await? * self.pragma("page_size").await?)
    }
}

#[async_trait]
impl Maintenance for SqliteMaintenance {
    async fn purge_settled(&self, state: JobState, finished_before: i64) -> Result<u64> {
        if state.is_live() {
            return Err(AppError::Validation(format!(
                "{} jobs are live and cannot be purged",
                state
            )));
        }

        let purged = sqlx::query(
            r#"
            DELETE FROM encode_jobs
            WHERE state = ?
            AND finished_at IS NOT NULL
            AND finished_at < ?
            "#,
        )
        .bind(state.as_str())
        .bind(finished_before)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        debug!(state = %state, finished_before, purged, "Settled jobs purged");
        Ok(purged)
    }

    async fn compact(&self) -> Result<i64> {
        let size_before = self.file_size().await?;

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let size_after = self.file_size().await?;
        let reclaimed = (size_before - size_after).max(0);
        info!(size_before, size_after, reclaimed, "Database compacted");

        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM encode_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let mut jobs = JobCounts::default();
        for (state, count) in rows {
            jobs.add(state.parse::<JobState>()?, count);
        }

        let clips: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clips")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let page_size = self.pragma("page_size").await?;
        Ok(StoreStats {
            size_bytes: self.pragma("page_count").await? * page_size,
            free_bytes: self.pragma("freelist_count").await? * page_size,
            jobs,
            clips,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, SqliteClipStore, SqliteJobQueue};
    use clipcast_core::domain::{EncodeJob, FailureKind};
    use clipcast_core::port::maintenance::MS_PER_DAY;
    use clipcast_core::port::{ClipStore, JobQueue};

    const NOW: i64 = 1_000 * MS_PER_DAY;

    async fn setup() -> (SqliteJobQueue, SqliteMaintenance) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        (SqliteJobQueue::new(pool.clone()), SqliteMaintenance::new(pool))
    }

    async fn insert_cancelled(queue: &SqliteJobQueue, id: &str, finished_at: i64) {
        let mut job = EncodeJob::new(id, format!("clip-{}", id), finished_at, 2);
        job.cancel(finished_at).unwrap();
        queue.insert(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_count_jobs_per_state() {
        let (queue, maintenance) = setup().await;
        let clips = SqliteClipStore::new(maintenance.pool.clone());
        clips.create_if_absent(&"clip-q".to_string(), 1).await.unwrap();

        queue.insert(&EncodeJob::new("q", "clip-q", 1, 2)).await.unwrap();
        queue.insert(&EncodeJob::new("c", "clip-c", 2, 2)).await.unwrap();
        queue.claim_next("w1", "t1", 10).await.unwrap().unwrap();
        insert_cancelled(&queue, "x", 5).await;

        let stats = maintenance.stats().await.unwrap();
        assert!(stats.size_bytes > 0);
        assert!(stats.free_bytes >= 0);
        assert_eq!(
            stats.jobs,
            JobCounts {
                queued: 1,
                in_flight: 1,
                cancelled: 1,
                ..JobCounts::default()
            }
        );
        assert_eq!(stats.clips, 1);
    }

    #[tokio::test]
    async fn test_compact() {
        let (_, maintenance) = setup().await;
        assert!(maintenance.compact().await.unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_purge_honours_state_and_cutoff() {
        let (queue, maintenance) = setup().await;
        let ten_days_ago = NOW - 10 * MS_PER_DAY;

        insert_cancelled(&queue, "old", ten_days_ago).await;
        insert_cancelled(&queue, "recent", NOW).await;

        let mut failed = EncodeJob::new("failed", "clip-failed", ten_days_ago, 2);
        failed
            .fail(FailureKind::EngineFailure, "exit 1", ten_days_ago)
            .unwrap();
        queue.insert(&failed).await.unwrap();

        queue
            .insert(&EncodeJob::new("live", "clip-live", ten_days_ago, 2))
            .await
            .unwrap();

        let cutoff = NOW - 7 * MS_PER_DAY;
        assert_eq!(
            maintenance.purge_settled(JobState::Cancelled, cutoff).await.unwrap(),
            1
        );
        assert!(queue.find_by_id(&"old".to_string()).await.unwrap().is_none());
        assert!(queue.find_by_id(&"recent".to_string()).await.unwrap().is_some());
        assert!(queue.find_by_id(&"failed".to_string()).await.unwrap().is_some());
        assert!(queue.find_by_id(&"live".to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_refuses_live_state() {
        let (_, maintenance) = setup().await;
        let err = maintenance
            .purge_settled(JobState::Queued, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
