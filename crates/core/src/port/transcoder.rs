// Transcoding Engine Port
// Abstraction over the external encoder (ffmpeg in production)

use crate::domain::{ClipId, FailureKind, TranscodeOutput};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Progress callback, receives the completed fraction in `0.0..=1.0`
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Why an in-flight encode was told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The clip was deleted while encoding
    ClipDeleted,
    /// The worker pool is shutting down
    Shutdown,
    /// Recovery revoked this worker's claim
    ClaimLost,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ClipDeleted => "clip_deleted",
            AbortReason::Shutdown => "shutdown",
            AbortReason::ClaimLost => "claim_lost",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiving side of an abort signal. `None` until an abort is requested.
pub type AbortSignal = watch::Receiver<Option<AbortReason>>;

/// Resolve once an abort has been requested.
///
/// Never resolves if the sending side goes away without aborting.
pub async fn aborted(signal: &mut AbortSignal) -> AbortReason {
    loop {
        if let Some(reason) = *signal.borrow_and_update() {
            return reason;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One encode request
pub struct TranscodeRequest {
    pub clip_id: ClipId,
    pub source: PathBuf,
    /// Empty directory the engine writes its output into
    pub sink: PathBuf,
    pub on_progress: ProgressFn,
    pub abort: AbortSignal,
    /// Receives the engine subprocess pid once it is spawned
    pub pid_sink: Option<watch::Sender<Option<i32>>>,
}

impl TranscodeRequest {
    pub fn report_pid(&self, pid: Option<u32>) {
        if let (Some(sink), Some(pid)) = (&self.pid_sink, pid) {
            let _ = sink.send(Some(pid as i32));
        }
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.abort.borrow()
    }
}

/// Transcoding errors
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Engine binary not found: {0}")]
    EngineNotFound(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Engine exited with code {code:?}: {stderr}")]
    EngineFailed { code: Option<i32>, stderr: String },

    #[error("Expected output missing: {0}")]
    OutputMissing(String),

    #[error("Aborted: {0}")]
    Aborted(AbortReason),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Process kill failed: {0}")]
    Killed(String),
}

impl TranscodeError {
    /// Failure classification, `None` for aborts (those are not failures)
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TranscodeError::SourceUnreadable(_) => Some(FailureKind::SourceUnavailable),
            TranscodeError::Aborted(_) => None,
            _ => Some(FailureKind::EngineFailure),
        }
    }
}

impl From<std::io::Error> for TranscodeError {
    fn from(err: std::io::Error) -> Self {
        TranscodeError::Io(err.to_string())
    }
}

/// Transcoder trait
///
/// Implementations:
/// - FfmpegTranscoder: drives ffprobe/ffmpeg subprocesses
/// - MockTranscoder: scripted outcomes for tests
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encode `req.source` into DASH renditions plus a thumbnail under `req.sink`
    ///
    /// # Errors
    /// - `TranscodeError::SourceUnreadable` if the source cannot be probed
    /// - `TranscodeError::Aborted` if `req.abort` fired; the subprocess is gone
    /// - any other variant for engine failures
    async fn transcode(&self, req: TranscodeRequest) -> Result<TranscodeOutput, TranscodeError>;

    /// Kill an engine process left behind by a previous worker
    async fn kill(&self, pid: i32) -> Result<(), TranscodeError>;

    /// Check if a process is still alive
    fn is_alive(&self, pid: i32) -> bool;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::Rendition;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Outcome of one scripted transcode call
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Write a small DASH output and succeed
        Success,
        /// Fail like a non-zero engine exit
        Fail(String),
        /// Fail like an unreadable source
        SourceUnreadable,
        /// Report some progress, then block until aborted
        HangUntilAbort,
        /// Panic inside the transcoder
        Panic(String),
    }

    /// Scripted transcoder.
    ///
    /// Behaviors are consumed one per call; the last one repeats.
    pub struct MockTranscoder {
        script: Mutex<VecDeque<MockBehavior>>,
        step_delay: Duration,
        engine_pid: Option<i32>,
        calls: Mutex<Vec<ClipId>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        alive_pids: Mutex<HashSet<i32>>,
        killed_pids: Mutex<Vec<i32>>,
    }

    impl MockTranscoder {
        pub fn new(behavior: MockBehavior) -> Self {
            Self::scripted(vec![behavior])
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        pub fn scripted(behaviors: Vec<MockBehavior>) -> Self {
            Self {
                script: Mutex::new(behaviors.into()),
                step_delay: Duration::from_millis(5),
                engine_pid: None,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                alive_pids: Mutex::new(HashSet::new()),
                killed_pids: Mutex::new(Vec::new()),
            }
        }

        /// Delay between progress steps
        pub fn with_step_delay(mut self, delay: Duration) -> Self {
            self.step_delay = delay;
            self
        }

        /// Report `pid` as the engine process of every call
        pub fn with_engine_pid(mut self, pid: i32) -> Self {
            self.engine_pid = Some(pid);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn calls_for(&self, clip_id: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|id| id.as_str() == clip_id)
                .count()
        }

        /// Highest number of concurrent transcode calls observed
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        /// Pretend a leftover engine process is running
        pub fn set_alive(&self, pid: i32) {
            self.alive_pids.lock().unwrap().insert(pid);
        }

        pub fn killed_pids(&self) -> Vec<i32> {
            self.killed_pids.lock().unwrap().clone()
        }

        fn next_behavior(&self) -> MockBehavior {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap_or(MockBehavior::Success)
            } else {
                script.front().cloned().unwrap_or(MockBehavior::Success)
            }
        }

        async fn write_output(sink: &std::path::Path) -> Result<TranscodeOutput, TranscodeError> {
            let segments = vec!["chunk-0-00001.m4s".to_string(), "chunk-0-00002.m4s".to_string()];
            tokio::fs::write(sink.join("manifest.mpd"), b"<MPD/>").await?;
            tokio::fs::write(sink.join("init-0.m4s"), b"init").await?;
            for segment in &segments {
                tokio::fs::write(sink.join(segment), b"segment").await?;
            }
            tokio::fs::write(sink.join("thumbnail.jpg"), b"jpeg").await?;

            Ok(TranscodeOutput {
                manifest: "manifest.mpd".to_string(),
                renditions: vec![Rendition {
                    index: 0,
                    width: 640,
                    height: 360,
                    fps: 30,
                    bitrate_kbps: 1000,
                    init_segment: "init-0.m4s".to_string(),
                    segments,
                }],
                audio: None,
                thumbnail: "thumbnail.jpg".to_string(),
            })
        }

        async fn run(&self, mut req: TranscodeRequest) -> Result<TranscodeOutput, TranscodeError> {
            let behavior = self.next_behavior();
            if let Some(pid) = self.engine_pid {
                self.set_alive(pid);
                req.report_pid(Some(pid as u32));
            }

            match behavior {
                MockBehavior::Success => {
                    for step in 1..=4 {
                        tokio::select! {
                            _ = tokio::time::sleep(self.step_delay) => {}
                            reason = aborted(&mut req.abort) => return Err(TranscodeError::Aborted(reason)),
                        }
                        (req.on_progress)(step as f64 / 4.0);
                    }
                    Self::write_output(&req.sink).await
                }
                MockBehavior::Fail(msg) => {
                    (req.on_progress)(0.3);
                    Err(TranscodeError::EngineFailed {
                        code: Some(1),
                        stderr: msg,
                    })
                }
                MockBehavior::SourceUnreadable => Err(TranscodeError::SourceUnreadable(format!(
                    "{}: invalid data found when processing input",
                    req.source.display()
                ))),
                MockBehavior::HangUntilAbort => {
                    (req.on_progress)(0.1);
                    let reason = aborted(&mut req.abort).await;
                    Err(TranscodeError::Aborted(reason))
                }
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg);
                }
            }
        }
    }

    #[async_trait]
    impl Transcoder for MockTranscoder {
        async fn transcode(&self, req: TranscodeRequest) -> Result<TranscodeOutput, TranscodeError> {
            self.calls.lock().unwrap().push(req.clip_id.clone());
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

            struct InFlight<'a>(&'a AtomicUsize);
            impl Drop for InFlight<'_> {
                fn drop(&mut self) {
                    self.0.fetch_sub(1, Ordering::SeqCst);
                }
            }
            let _guard = InFlight(&self.in_flight);

            self.run(req).await
        }

        async fn kill(&self, pid: i32) -> Result<(), TranscodeError> {
            self.alive_pids.lock().unwrap().remove(&pid);
            self.killed_pids.lock().unwrap().push(pid);
            Ok(())
        }

        fn is_alive(&self, pid: i32) -> bool {
            self.alive_pids.lock().unwrap().contains(&pid)
        }
    }
}
