// Clipcast Infrastructure - System Adapters
// Implements: Transcoder (ffmpeg), ArtifactStore (local filesystem), SystemProbe

pub mod ffmpeg;
pub mod fs_artifact_store;
pub mod process;
pub mod system_probe_impl;

pub use ffmpeg::{FfmpegConfig, FfmpegSetupError, FfmpegTranscoder};
pub use fs_artifact_store::FsArtifactStore;
pub use system_probe_impl::SystemProbeImpl;
