// Port Layer - Interfaces for external dependencies

pub mod artifact_store;
pub mod clip_store;
pub mod id_provider; // For deterministic testing
pub mod job_queue;
pub mod maintenance;
pub mod system_probe;
pub mod time_provider;
pub mod transcoder;

// Re-exports
pub use artifact_store::{ArtifactStore, StagedEntry, StorageError};
pub use clip_store::ClipStore;
pub use id_provider::IdProvider;
pub use job_queue::JobQueue;
pub use maintenance::{JobCounts, Maintenance, RetentionPolicy, StoreStats};
pub use system_probe::{SystemMetrics, SystemProbe};
pub use time_provider::TimeProvider;
pub use transcoder::{
    aborted, AbortReason, AbortSignal, ProgressFn, TranscodeError, TranscodeRequest, Transcoder,
};
