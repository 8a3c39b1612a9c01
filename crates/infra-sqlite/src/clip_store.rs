// SQLite ClipStore implementation
use crate::error::map_sqlx_error;
use async_trait::async_trait;
use clipcast_core::domain::{ClipId, ClipState};
use clipcast_core::error::{AppError, Result};
use clipcast_core::port::ClipStore;
use sqlx::SqlitePool;
use std::str::FromStr;

pub struct SqliteClipStore {
    pool: SqlitePool,
}

impl SqliteClipStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClipStore for SqliteClipStore {
    async fn create_if_absent(&self, clip_id: &ClipId, now: i64) -> Result<ClipState> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO clips (clip_id, state, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(clip_id)
        .bind(ClipState::Queued.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        // A concurrent cancel can delete the row between the two statements
        self.get_state(clip_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Clip {}", clip_id)))
    }

    async fn get_state(&self, clip_id: &ClipId) -> Result<Option<ClipState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM clips WHERE clip_id = ?")
            .bind(clip_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        state
            .map(|s| ClipState::from_str(&s).map_err(AppError::from))
            .transpose()
    }

    async fn set_state(&self, clip_id: &ClipId, state: ClipState, now: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE clips SET state = ?, updated_at = ?
            WHERE clip_id = ? AND state NOT IN (?, ?)
            "#,
        )
        .bind(state.as_str())
        .bind(now)
        .bind(clip_id)
        .bind(ClipState::Ready.as_str())
        .bind(ClipState::Failed.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_state(clip_id).await? {
            Some(current) => Err(AppError::ClipSettled {
                clip_id: clip_id.clone(),
                state: current,
            }),
            None => Err(AppError::NotFound(format!("Clip {}", clip_id))),
        }
    }

    async fn delete(&self, clip_id: &ClipId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM clips WHERE clip_id = ?")
            .bind(clip_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}
