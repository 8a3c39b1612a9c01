//! RPC Method Handlers
//!
//! Thin adapters from RPC types onto the encoding pipeline.

use crate::error::{code, to_rpc_error};
use crate::types::{
    CancelRequest, CancelResponse, EnqueueRequest, EnqueueResponse, MaintenanceRequest,
    MaintenanceResponse, ProgressRequest, ProgressResponse, StatsResponse, StatusRequest,
    StatusResponse,
};
use clipcast_core::application::{
    self, CancellationRegistry, EncodingPipeline, Housekeeper, ProgressRegistry,
};
use clipcast_core::port::RetentionPolicy;
use jsonrpsee::types::ErrorObjectOwned;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Upper bound on ids per progress poll
pub const MAX_PROGRESS_IDS: usize = 1000;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    pipeline: Arc<EncodingPipeline>,
    progress: Arc<ProgressRegistry>,
    cancellations: Arc<CancellationRegistry>,
    housekeeper: Arc<Housekeeper>,
    start_time: Instant,
}

impl RpcHandler {
    pub fn new(
        pipeline: Arc<EncodingPipeline>,
        progress: Arc<ProgressRegistry>,
        cancellations: Arc<CancellationRegistry>,
        housekeeper: Arc<Housekeeper>,
    ) -> Self {
        Self {
            pipeline,
            progress,
            cancellations,
            housekeeper,
            start_time: Instant::now(),
        }
    }

    /// clips.enqueue.v1
    pub async fn enqueue(&self, params: EnqueueRequest) -> Result<EnqueueResponse, ErrorObjectOwned> {
        let receipt = self
            .pipeline
            .enqueue(application::EnqueueRequest {
                clip_id: params.clip_id,
                source_path: params.source_path.map(PathBuf::from),
            })
            .await
            .map_err(to_rpc_error)?;

        Ok(EnqueueResponse {
            job_id: receipt.job_id,
            clip_id: receipt.clip_id,
            progress: receipt.progress,
        })
    }

    /// clips.progress.v1
    pub async fn progress(&self, params: ProgressRequest) -> Result<ProgressResponse, ErrorObjectOwned> {
        if params.clip_ids.len() > MAX_PROGRESS_IDS {
            return Err(ErrorObjectOwned::owned(
                code::VALIDATION_ERROR,
                format!("At most {} clip ids per request", MAX_PROGRESS_IDS),
                None::<()>,
            ));
        }

        Ok(ProgressResponse {
            clips: self.pipeline.progress(&params.clip_ids).into_iter().collect(),
        })
    }

    /// clips.cancel.v1
    pub async fn cancel(&self, params: CancelRequest) -> Result<CancelResponse, ErrorObjectOwned> {
        let cancelled = self
            .pipeline
            .cancel(&params.clip_id)
            .await
            .map_err(to_rpc_error)?;

        Ok(CancelResponse {
            clip_id: params.clip_id,
            cancelled,
        })
    }

    /// clips.status.v1
    pub async fn status(&self, params: StatusRequest) -> Result<StatusResponse, ErrorObjectOwned> {
        self.pipeline
            .status(&params.clip_id)
            .await
            .map_err(to_rpc_error)
    }

    /// admin.stats.v1
    pub async fn stats(&self) -> Result<StatsResponse, ErrorObjectOwned> {
        let stats = self.housekeeper.stats().await.map_err(to_rpc_error)?;

        Ok(StatsResponse {
            jobs: stats.jobs,
            clips: stats.clips,
            encoding_now: self.cancellations.in_flight(),
            tracked_progress: self.progress.len(),
            db_size_bytes: stats.size_bytes,
            db_free_bytes: stats.free_bytes,
            uptime_seconds: self.start_time.elapsed().as_secs() as i64,
        })
    }

    /// admin.maintenance.v1
    pub async fn maintenance(
        &self,
        params: MaintenanceRequest,
    ) -> Result<MaintenanceResponse, ErrorObjectOwned> {
        let retention = params
            .retention_days
            .map(RetentionPolicy::uniform)
            .unwrap_or(self.housekeeper.config().retention);

        let report = self
            .housekeeper
            .run_pass(retention, params.force_compact)
            .await
            .map_err(to_rpc_error)?;

        info!(
            purged = report.purged.settled(),
            compacted = report.compacted,
            "Manual maintenance completed"
        );

        Ok(MaintenanceResponse {
            purged: report.purged,
            compacted: report.compacted,
            db_size_before: report.size_before,
            db_size_after: report.size_after,
        })
    }
}
