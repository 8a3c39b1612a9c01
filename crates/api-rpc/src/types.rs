//! RPC Request/Response Types
//!
//! Parameters and results of the versioned JSON-RPC methods.

use clipcast_core::application::ClipStatus;
use clipcast_core::port::JobCounts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// clips.enqueue.v1 - Hand an uploaded clip to the encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub clip_id: String,
    /// Uploaded file to import; omitted when the source is already stored
    #[serde(default)]
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub clip_id: String,
    pub progress: i32,
}

/// clips.progress.v1 - Batched progress poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRequest {
    pub clip_ids: Vec<String>,
}

/// Only tracked clips appear in `clips`; an empty map means nothing is in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub clips: BTreeMap<String, i32>,
}

/// clips.cancel.v1 - The clip was deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub clip_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub clip_id: String,
    pub cancelled: bool,
}

/// clips.status.v1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub clip_id: String,
}

pub type StatusResponse = ClipStatus;

/// admin.stats.v1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub jobs: JobCounts,
    pub clips: i64,
    pub encoding_now: usize,
    pub tracked_progress: usize,
    pub db_size_bytes: i64,
    /// Reclaimable by a compaction
    pub db_free_bytes: i64,
    pub uptime_seconds: i64,
}

/// admin.maintenance.v1 - Purge settled jobs past retention, compact when due
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    #[serde(default)]
    pub force_compact: bool,
    /// One retention window for every settled state, this run only
    #[serde(default)]
    pub retention_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceResponse {
    pub purged: JobCounts,
    pub compacted: bool,
    pub db_size_before: i64,
    pub db_size_after: i64,
}
