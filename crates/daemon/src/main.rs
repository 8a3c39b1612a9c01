//! Clipcast Daemon - Main Entry Point
//! Composition root: wires storage, the ffmpeg engine, the worker pool and the RPC surface

mod config;
mod logging;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use clipcast_api_rpc::{RpcHandler, RpcServer};
use clipcast_core::application::{
    shutdown_channel, CancellationRegistry, EncodingPipeline, Housekeeper, JobQueueService,
    MaintenanceScheduler, PipelineDeps, ProgressRegistry, RecoveryService, RetryPolicy, WorkerPool,
};
use clipcast_core::port::id_provider::UuidProvider;
use clipcast_core::port::time_provider::SystemTimeProvider;
use clipcast_core::port::{ArtifactStore, ClipStore, JobQueue, Maintenance, SystemProbe, TimeProvider, Transcoder};
use clipcast_infra_sqlite::{create_pool, run_migrations, SqliteClipStore, SqliteJobQueue, SqliteMaintenance};
use clipcast_infra_system::{FfmpegTranscoder, FsArtifactStore, SystemProbeImpl};
use crate::config::DaemonConfig;
use crate::logging::LogFormat;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging
    let config = DaemonConfig::load()?;
    let log_dir = config.log_dir();
    let _log_guard = logging::init(LogFormat::from_env(), log_dir.as_deref())?;

    info!("Clipcast daemon v{} starting...", VERSION);

    // 2. Database
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    info!(db_path = %db_path.display(), "Initializing database...");

    let pool = create_pool(&db_path.to_string_lossy())
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    // 3. Adapters
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let jobs: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(pool.clone()));
    let clips: Arc<dyn ClipStore> = Arc::new(SqliteClipStore::new(pool.clone()));
    let maintenance: Arc<dyn Maintenance> = Arc::new(SqliteMaintenance::new(pool.clone()));

    let artifact_root = config.artifact_root();
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(
        FsArtifactStore::open(&artifact_root)
            .await
            .with_context(|| format!("Failed to open artifact store at {}", artifact_root.display()))?,
    );
    let transcoder: Arc<dyn Transcoder> = Arc::new(
        FfmpegTranscoder::new(config.ffmpeg.clone()).context("ffmpeg transcoder setup failed")?,
    );
    let system_probe: Arc<dyn SystemProbe> = Arc::new(SystemProbeImpl::new(&artifact_root));

    // 4. Application services
    let worker_config = config.worker_config();
    let progress = Arc::new(ProgressRegistry::new(
        time_provider.clone(),
        config.progress_config(),
    ));
    let cancellations = Arc::new(CancellationRegistry::new());
    let queue = Arc::new(JobQueueService::new(
        jobs,
        progress.clone(),
        Arc::new(UuidProvider),
        time_provider.clone(),
        worker_config.max_attempts,
    ));
    let retry_policy = Arc::new(RetryPolicy::new(
        worker_config.retry_base_delay_ms,
        worker_config.max_finalize_attempts,
    ));

    // 5. Crash recovery: every claim left in the database belongs to a dead process
    info!("Running crash recovery...");
    let recovery = Arc::new(RecoveryService::new(
        queue.clone(),
        clips.clone(),
        artifacts.clone(),
        transcoder.clone(),
        progress.clone(),
        retry_policy,
        time_provider.clone(),
        worker_config.liveness_ms,
    ));
    match recovery.recover_on_startup().await {
        Ok(report) => info!(
            requeued = report.requeued,
            failed = report.failed,
            cancelled = report.cancelled,
            killed = report.killed,
            "Crash recovery completed"
        ),
        Err(e) => error!(error = %e, "Crash recovery failed"),
    }

    // 6. JSON-RPC server
    let pipeline = Arc::new(EncodingPipeline::new(
        queue.clone(),
        clips.clone(),
        artifacts.clone(),
        progress.clone(),
        cancellations.clone(),
        time_provider.clone(),
    ));
    let housekeeper = Arc::new(Housekeeper::new(
        maintenance,
        config.maintenance_config(),
        time_provider.clone(),
    ));
    let handler = Arc::new(RpcHandler::new(
        pipeline,
        progress.clone(),
        cancellations.clone(),
        housekeeper.clone(),
    ));
    let rpc_handle = RpcServer::new(config.rpc.clone(), handler)
        .start()
        .await
        .context("RPC server start failed")?;

    // 7. Worker pool
    let pool_handle = WorkerPool::start(
        PipelineDeps {
            queue,
            clips,
            artifacts,
            transcoder,
            progress: progress.clone(),
            cancellations,
            system_probe,
            time_provider,
        },
        worker_config,
    );

    // 8. Background loops
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let maintenance_scheduler = MaintenanceScheduler::new(housekeeper, config.maintenance_interval());
    let maintenance_task = tokio::spawn(maintenance_scheduler.run(shutdown_rx.clone()));
    let sweeper_task = tokio::spawn(progress.run_sweeper(config.sweep_interval(), shutdown_rx.clone()));
    let recovery_task = tokio::spawn(recovery.run(config.recovery_interval(), shutdown_rx));

    info!(workers = pool_handle.size(), "System ready. Waiting for clips...");

    // 9. Wait for shutdown signal
    shutdown_signal().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 10. Graceful shutdown: stop intake first, then let in-flight encodes settle
    if let Err(e) = rpc_handle.stop() {
        warn!(error = %e, "RPC server already stopped");
    }
    pool_handle.shutdown().await;
    shutdown_tx.shutdown();
    for task in [maintenance_task, sweeper_task, recovery_task] {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    pool.close().await;

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
