// Application Layer - Use Cases and Business Logic

pub mod cancel;
pub mod maintenance;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod worker;

// Re-exports
pub use cancel::CancellationRegistry;
pub use maintenance::{HousekeepingReport, Housekeeper, MaintenanceConfig, MaintenanceScheduler};
pub use pipeline::{ClipStatus, EncodingPipeline, EnqueueReceipt, EnqueueRequest, JobSummary};
pub use progress::{ProgressConfig, ProgressRegistry, ProgressWriter};
pub use queue::JobQueueService;
pub use recovery::{RecoveryReport, RecoveryService};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{
    shutdown_channel, PipelineDeps, ShutdownSender, ShutdownToken, Worker, WorkerConfig, WorkerPool,
};
