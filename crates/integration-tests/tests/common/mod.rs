//! Shared harness: real SQLite database and filesystem artifact store under a
//! temp directory, scripted transcoder.

#![allow(dead_code)]

use async_trait::async_trait;
use clipcast_core::application::{
    CancellationRegistry, EncodingPipeline, EnqueueRequest, JobQueueService, PipelineDeps,
    ProgressConfig, ProgressRegistry, RecoveryService, RetryPolicy, WorkerConfig, WorkerPool,
};
use clipcast_core::domain::{ArtifactSet, ClipId, ClipState, EncodeJob, TranscodeOutput};
use clipcast_core::port::id_provider::UuidProvider;
use clipcast_core::port::system_probe::mocks::MockSystemProbe;
use clipcast_core::port::time_provider::SystemTimeProvider;
use clipcast_core::port::transcoder::mocks::MockTranscoder;
use clipcast_core::port::{
    ArtifactStore, ClipStore, JobQueue, StagedEntry, StorageError, TimeProvider, Transcoder,
};
use clipcast_infra_sqlite::{create_pool, run_migrations, SqliteClipStore, SqliteJobQueue};
use clipcast_infra_system::FsArtifactStore;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub root: PathBuf,
    pub pool: SqlitePool,
    pub jobs: Arc<SqliteJobQueue>,
    pub clips: Arc<SqliteClipStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub transcoder: Arc<MockTranscoder>,
    pub progress: Arc<ProgressRegistry>,
    pub cancellations: Arc<CancellationRegistry>,
    pub queue: Arc<JobQueueService>,
    pub pipeline: Arc<EncodingPipeline>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub config: WorkerConfig,
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        pool_size: 2,
        max_attempts: 2,
        max_finalize_attempts: 3,
        liveness_ms: 2_000,
        heartbeat_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(100),
        retry_base_delay_ms: 10,
        min_free_disk_mb: 0,
    }
}

impl Harness {
    pub async fn open(root: &Path, transcoder: MockTranscoder) -> Self {
        let store = FsArtifactStore::open(root.join("artifacts")).await.unwrap();
        Self::open_with(root, transcoder, Arc::new(store)).await
    }

    pub async fn open_with(
        root: &Path,
        transcoder: MockTranscoder,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let db_path = root.join("meta.db");
        let pool = create_pool(&db_path.to_string_lossy()).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let config = worker_config();
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let jobs = Arc::new(SqliteJobQueue::new(pool.clone()));
        let clips = Arc::new(SqliteClipStore::new(pool.clone()));
        let progress = Arc::new(ProgressRegistry::new(
            time_provider.clone(),
            ProgressConfig::default(),
        ));
        let cancellations = Arc::new(CancellationRegistry::new());
        let queue = Arc::new(
            JobQueueService::new(
                jobs.clone(),
                progress.clone(),
                Arc::new(UuidProvider),
                time_provider.clone(),
                config.max_attempts,
            )
            .with_poll_interval(Duration::from_millis(20)),
        );
        let pipeline = Arc::new(EncodingPipeline::new(
            queue.clone(),
            clips.clone(),
            artifacts.clone(),
            progress.clone(),
            cancellations.clone(),
            time_provider.clone(),
        ));

        Self {
            root: root.to_path_buf(),
            pool,
            jobs,
            clips,
            artifacts,
            transcoder: Arc::new(transcoder),
            progress,
            cancellations,
            queue,
            pipeline,
            time_provider,
            config,
        }
    }

    pub fn deps(&self) -> PipelineDeps {
        self.deps_with(self.transcoder.clone())
    }

    pub fn deps_with(&self, transcoder: Arc<dyn Transcoder>) -> PipelineDeps {
        PipelineDeps {
            queue: self.queue.clone(),
            clips: self.clips.clone(),
            artifacts: self.artifacts.clone(),
            transcoder,
            progress: self.progress.clone(),
            cancellations: self.cancellations.clone(),
            system_probe: Arc::new(MockSystemProbe::new(4)),
            time_provider: self.time_provider.clone(),
        }
    }

    pub fn start_pool(&self, size: usize) -> WorkerPool {
        WorkerPool::start(
            self.deps(),
            WorkerConfig {
                pool_size: size,
                ..self.config.clone()
            },
        )
    }

    pub fn recovery(&self, liveness_ms: i64) -> RecoveryService {
        RecoveryService::new(
            self.queue.clone(),
            self.clips.clone(),
            self.artifacts.clone(),
            self.transcoder.clone(),
            self.progress.clone(),
            Arc::new(RetryPolicy::new(
                self.config.retry_base_delay_ms,
                self.config.max_finalize_attempts,
            )),
            self.time_provider.clone(),
            liveness_ms,
        )
    }

    /// Write a fake upload and enqueue it
    pub async fn enqueue(&self, clip_id: &str) -> String {
        let uploads = self.root.join("uploads");
        tokio::fs::create_dir_all(&uploads).await.unwrap();
        let upload = uploads.join(format!("{}.mp4", clip_id));
        tokio::fs::write(&upload, b"not really a video").await.unwrap();

        self.pipeline
            .enqueue(EnqueueRequest {
                clip_id: clip_id.to_string(),
                source_path: Some(upload),
            })
            .await
            .unwrap()
            .job_id
    }

    pub fn progress_of(&self, clip_id: &str) -> Option<i32> {
        self.pipeline
            .progress(&[clip_id.to_string()])
            .get(clip_id)
            .copied()
    }

    pub async fn job(&self, job_id: &str) -> EncodeJob {
        self.jobs
            .find_by_id(&job_id.to_string())
            .await
            .unwrap()
            .expect("job exists")
    }

    pub async fn clip_state(&self, clip_id: &str) -> Option<ClipState> {
        self.clips.get_state(&clip_id.to_string()).await.unwrap()
    }

    pub async fn artifacts_of(&self, clip_id: &str) -> Option<ArtifactSet> {
        self.artifacts
            .load_artifacts(&clip_id.to_string())
            .await
            .unwrap()
    }

    pub async fn has_source(&self, clip_id: &str) -> bool {
        self.artifacts.source_path(&clip_id.to_string()).await.is_ok()
    }

    pub async fn staged(&self) -> Vec<StagedEntry> {
        self.artifacts.list_staged().await.unwrap()
    }

    pub async fn wait_for_clip(&self, clip_id: &str, state: ClipState) {
        wait_until(move || async move { self.clip_state(clip_id).await == Some(state) }).await;
    }

    pub async fn wait_for_progress(&self, clip_id: &str, pred: impl Fn(Option<i32>) -> bool) {
        let pred = &pred;
        wait_until(move || async move { pred(self.progress_of(clip_id)) }).await;
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

pub fn temp_root() -> TempDir {
    tempfile::tempdir().unwrap()
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {:?}", WAIT_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Filesystem store whose first `failures` publications fail
pub struct FlakyPublish {
    inner: FsArtifactStore,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyPublish {
    pub async fn open(root: &Path, failures: usize) -> Self {
        Self {
            inner: FsArtifactStore::open(root.join("artifacts")).await.unwrap(),
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for FlakyPublish {
    async fn import_source(&self, clip_id: &ClipId, from: &Path) -> Result<PathBuf, StorageError> {
        self.inner.import_source(clip_id, from).await
    }

    async fn source_path(&self, clip_id: &ClipId) -> Result<PathBuf, StorageError> {
        self.inner.source_path(clip_id).await
    }

    async fn delete_source(&self, clip_id: &ClipId) -> Result<(), StorageError> {
        self.inner.delete_source(clip_id).await
    }

    async fn stage_output(&self, clip_id: &ClipId, attempt: i32) -> Result<PathBuf, StorageError> {
        self.inner.stage_output(clip_id, attempt).await
    }

    async fn publish(
        &self,
        clip_id: &ClipId,
        staged: &Path,
        output: &TranscodeOutput,
        now: i64,
    ) -> Result<ArtifactSet, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::io(
                staged,
                std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
            ));
        }
        self.inner.publish(clip_id, staged, output, now).await
    }

    async fn discard_staged(&self, staged: &Path) -> Result<(), StorageError> {
        self.inner.discard_staged(staged).await
    }

    async fn load_artifacts(&self, clip_id: &ClipId) -> Result<Option<ArtifactSet>, StorageError> {
        self.inner.load_artifacts(clip_id).await
    }

    async fn delete_outputs(&self, clip_id: &ClipId) -> Result<(), StorageError> {
        self.inner.delete_outputs(clip_id).await
    }

    async fn list_staged(&self) -> Result<Vec<StagedEntry>, StorageError> {
        self.inner.list_staged().await
    }
}

/// Records every distinct progress value a poller saw, in order
pub struct ProgressTrace {
    pub values: Vec<Option<i32>>,
}

impl ProgressTrace {
    pub fn push(&mut self, value: Option<i32>) {
        if self.values.last() != Some(&value) {
            self.values.push(value);
        }
    }

    /// Observed tracked values, ignoring the trailing absence
    pub fn tracked(&self) -> Vec<i32> {
        self.values.iter().filter_map(|v| *v).collect()
    }
}
