// ffmpeg Transcoder
// Drives ffprobe/ffmpeg subprocesses to produce MPEG-DASH renditions and a thumbnail

pub mod command;
pub mod ladder;
pub mod probe;
pub mod progress;

use crate::process;
use async_trait::async_trait;
use clipcast_core::application::worker::constants::GRACEFUL_SHUTDOWN_TIMEOUT_MS;
use clipcast_core::domain::{AudioTrack, Rendition, TranscodeOutput};
use clipcast_core::port::{TranscodeError, TranscodeRequest, Transcoder};
use command::EngineProcess;
use ladder::{Ladder, Quality};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "manifest.mpd";
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

#[derive(Error, Debug)]
pub enum FfmpegSetupError {
    #[error("Invalid quality preset '{0}': expected WxH-FPS@Mbps")]
    InvalidPreset(String),

    #[error("No quality presets configured")]
    NoPresets,

    #[error("{0} not found")]
    BinaryNotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    /// Binary name (looked up on PATH) or absolute path
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// x264 speed preset
    pub preset: String,
    pub tune: Option<String>,
    /// 0 lets ffmpeg decide
    pub threads: u32,
    pub segment_seconds: u32,
    pub audio_bitrate: String,
    /// Comma separated `WxH-FPS@Mbps` presets
    pub quality_presets: String,
    /// Environment variables passed through to the engine
    pub env_allowlist: Vec<String>,
    /// Time between SIGTERM and SIGKILL when stopping the engine
    pub kill_grace_ms: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            preset: "veryfast".to_string(),
            tune: Some("film".to_string()),
            threads: 0,
            segment_seconds: 2,
            audio_bitrate: "128k".to_string(),
            quality_presets: ladder::DEFAULT_QUALITY_PRESETS.to_string(),
            env_allowlist: ["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            kill_grace_ms: GRACEFUL_SHUTDOWN_TIMEOUT_MS as u64,
        }
    }
}

/// Keep only allow-listed variables
fn filter_env<I>(vars: I, allowlist: &[String]) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(k, _)| allowlist.contains(k))
        .collect()
}

pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    presets: Vec<Quality>,
    config: FfmpegConfig,
    envs: Vec<(String, String)>,
}

impl FfmpegTranscoder {
    /// Resolve both binaries and parse the quality presets
    pub fn new(config: FfmpegConfig) -> Result<Self, FfmpegSetupError> {
        let ffmpeg = which::which(&config.ffmpeg_path)
            .map_err(|_| FfmpegSetupError::BinaryNotFound(config.ffmpeg_path.clone()))?;
        let ffprobe = which::which(&config.ffprobe_path)
            .map_err(|_| FfmpegSetupError::BinaryNotFound(config.ffprobe_path.clone()))?;
        let presets = ladder::parse_presets(&config.quality_presets)?;
        let envs = filter_env(std::env::vars(), &config.env_allowlist);

        info!(
            ffmpeg = %ffmpeg.display(),
            ffprobe = %ffprobe.display(),
            presets = presets.len(),
            "ffmpeg transcoder ready"
        );

        Ok(Self {
            ffmpeg,
            ffprobe,
            presets,
            config,
            envs,
        })
    }

    fn engine(&self) -> EngineProcess<'_> {
        EngineProcess {
            binary: &self.ffmpeg,
            envs: &self.envs,
            kill_grace: Duration::from_millis(self.config.kill_grace_ms),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, mut req: TranscodeRequest) -> Result<TranscodeOutput, TranscodeError> {
        let info = probe::probe(&self.ffprobe, &req.source, &self.envs).await?;
        let ladder = ladder::select(&self.presets, info.width, info.height, info.fps);

        info!(
            clip_id = %req.clip_id,
            width = info.width,
            height = info.height,
            fps = info.fps,
            duration_secs = info.duration_secs,
            audio_streams = info.audio_streams,
            renditions = ladder.renditions.len(),
            "Transcoding clip"
        );

        let engine = self.engine();

        let thumbnail = command::thumbnail(
            &req.source,
            info.thumbnail_offset(),
            &req.sink.join(THUMBNAIL_FILE),
        );
        engine.run(&thumbnail, &mut req, |_| {}).await?;

        let dash = command::dash(
            &self.config,
            &req.source,
            &info,
            &ladder,
            &req.sink.join(MANIFEST_FILE),
        );
        let mut parser = progress::ProgressParser::new(info.duration_secs, info.total_frames());
        let on_progress = req.on_progress.clone();
        engine
            .run(&dash, &mut req, move |line| {
                if let Some(fraction) = parser.feed(line) {
                    on_progress(fraction);
                }
            })
            .await?;

        let audio_bitrate_kbps = parse_kbps(&self.config.audio_bitrate);
        collect_output(&req.sink, &ladder, info.audio_streams > 0, audio_bitrate_kbps).await
    }

    async fn kill(&self, pid: i32) -> Result<(), TranscodeError> {
        process::kill_graceful(pid, Duration::from_millis(self.config.kill_grace_ms)).await
    }

    fn is_alive(&self, pid: i32) -> bool {
        process::is_alive(pid)
    }
}

/// `128k` -> 128
fn parse_kbps(bitrate: &str) -> u32 {
    let trimmed = bitrate.trim();
    match trimmed.strip_suffix(&['k', 'K'][..]) {
        Some(kbps) => kbps.parse().unwrap_or(0),
        None => trimmed.parse::<u32>().map(|bps| bps / 1000).unwrap_or(0),
    }
}

/// Segments of one representation, in playback order
fn segments_for(names: &[String], representation: usize) -> Vec<String> {
    let prefix = format!("chunk-{}-", representation);
    let mut segments: Vec<String> = names
        .iter()
        .filter(|n| n.starts_with(&prefix) && n.ends_with(".m4s"))
        .cloned()
        .collect();
    segments.sort();
    segments
}

/// Describe what the engine wrote into `sink`
async fn collect_output(
    sink: &Path,
    ladder: &Ladder,
    has_audio: bool,
    audio_bitrate_kbps: u32,
) -> Result<TranscodeOutput, TranscodeError> {
    let mut names = Vec::new();
    let mut dir = tokio::fs::read_dir(sink).await?;
    while let Some(entry) = dir.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().to_string());
    }

    let require = |name: &str| {
        if names.iter().any(|n| n == name) {
            Ok(name.to_string())
        } else {
            Err(TranscodeError::OutputMissing(name.to_string()))
        }
    };

    let manifest = require(MANIFEST_FILE)?;
    let thumbnail = require(THUMBNAIL_FILE)?;

    let mut renditions = Vec::with_capacity(ladder.renditions.len());
    for (index, quality) in ladder.renditions.iter().enumerate() {
        let init_segment = require(&format!("init-{}.m4s", index))?;
        let segments = segments_for(&names, index);
        if segments.is_empty() {
            return Err(TranscodeError::OutputMissing(format!("chunk-{}-*.m4s", index)));
        }
        renditions.push(Rendition {
            index: index as u32,
            width: quality.width,
            height: quality.height,
            fps: quality.fps,
            bitrate_kbps: quality.bitrate_kbps(),
            init_segment,
            segments,
        });
    }

    let audio = if has_audio {
        let index = ladder.renditions.len();
        let init_segment = require(&format!("init-{}.m4s", index))?;
        let segments = segments_for(&names, index);
        if segments.is_empty() {
            warn!(sink = %sink.display(), "Audio stream produced no segments");
            None
        } else {
            Some(AudioTrack {
                index: index as u32,
                bitrate_kbps: audio_bitrate_kbps,
                init_segment,
                segments,
            })
        }
    } else {
        None
    };

    Ok(TranscodeOutput {
        manifest,
        renditions,
        audio,
        thumbnail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder(rungs: usize) -> Ladder {
        let presets = ladder::parse_presets(ladder::DEFAULT_QUALITY_PRESETS).unwrap();
        Ladder {
            renditions: presets.into_iter().take(rungs).collect(),
            vertical: false,
        }
    }

    async fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            tokio::fs::write(dir.join(name), b"x").await.unwrap();
        }
    }

    #[test]
    fn test_env_allowlist() {
        let vars = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "hunter2".to_string()),
        ];
        let filtered = filter_env(vars, &FfmpegConfig::default().env_allowlist);
        assert_eq!(filtered, vec![("PATH".to_string(), "/usr/bin".to_string())]);
    }

    #[test]
    fn test_parse_kbps() {
        assert_eq!(parse_kbps("128k"), 128);
        assert_eq!(parse_kbps("96000"), 96);
        assert_eq!(parse_kbps("fast"), 0);
    }

    #[tokio::test]
    async fn test_collect_output_with_audio() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "manifest.mpd",
                "thumbnail.jpg",
                "init-0.m4s",
                "chunk-0-00002.m4s",
                "chunk-0-00001.m4s",
                "init-1.m4s",
                "chunk-1-00001.m4s",
                "init-2.m4s",
                "chunk-2-00001.m4s",
            ],
        )
        .await;

        let output = collect_output(dir.path(), &ladder(2), true, 128).await.unwrap();

        assert_eq!(output.renditions.len(), 2);
        assert_eq!(
            output.renditions[0].segments,
            vec!["chunk-0-00001.m4s", "chunk-0-00002.m4s"]
        );
        assert_eq!(output.renditions[1].height, 480);
        let audio = output.audio.unwrap();
        assert_eq!(audio.index, 2);
        assert_eq!(audio.init_segment, "init-2.m4s");
    }

    #[tokio::test]
    async fn test_collect_output_missing_rendition() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &["manifest.mpd", "thumbnail.jpg", "init-0.m4s", "chunk-0-00001.m4s"],
        )
        .await;

        let err = collect_output(dir.path(), &ladder(2), false, 128).await.unwrap_err();
        assert!(matches!(err, TranscodeError::OutputMissing(name) if name == "init-1.m4s"));
    }

    #[test]
    fn test_missing_binary_is_reported() {
        let config = FfmpegConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ..FfmpegConfig::default()
        };
        assert!(matches!(
            FfmpegTranscoder::new(config),
            Err(FfmpegSetupError::BinaryNotFound(_))
        ));
    }
}
