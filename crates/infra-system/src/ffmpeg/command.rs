//! ffmpeg command builder and runner.

use super::ladder::{Ladder, Quality};
use super::probe::VideoInfo;
use super::progress::is_progress_line;
use super::FfmpegConfig;
use crate::process;
use clipcast_core::port::{aborted, TranscodeError, TranscodeRequest};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Diagnostic lines kept for the error message of a failed run
const STDERR_TAIL_LINES: usize = 20;

/// Builder for ffmpeg argument lists
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    input_args: Vec<String>,
    output_args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }

    /// Add an argument placed before `-i`
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Option followed by its value
    pub fn opt(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.output_arg(key).output_arg(value)
    }

    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-nostdin".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
        ];
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

fn mbit(mbps: f32) -> String {
    format!("{:.1}M", mbps)
}

/// Single JPEG frame
pub fn thumbnail(source: &Path, at_secs: f64, dest: &Path) -> FfmpegCommand {
    FfmpegCommand::new(source, dest)
        .seek(at_secs)
        .opt("-frames:v", "1")
        .opt("-q:v", "5")
}

fn rendition_args(index: usize, quality: &Quality) -> Vec<String> {
    vec![
        "-map".to_string(),
        "0:v:0".to_string(),
        format!("-s:v:{}", index),
        format!("{}x{}", quality.width, quality.height),
        format!("-b:v:{}", index),
        mbit(quality.bitrate_mbps),
        format!("-maxrate:v:{}", index),
        mbit(quality.bitrate_mbps * 1.2),
        format!("-bufsize:v:{}", index),
        mbit(quality.bitrate_mbps * 2.0),
        format!("-r:v:{}", index),
        quality.fps.to_string(),
    ]
}

/// MPEG-DASH encode of the whole ladder into `manifest`'s directory
///
/// Representation ids follow map order: video rungs first, then the merged
/// audio stream.
pub fn dash(
    config: &FfmpegConfig,
    source: &Path,
    info: &VideoInfo,
    ladder: &Ladder,
    manifest: &Path,
) -> FfmpegCommand {
    let gop = (info.fps.round() as u32).max(1) * config.segment_seconds.max(1);

    let mut cmd = FfmpegCommand::new(source, manifest)
        .opt("-c:v", "libx264")
        .opt("-preset", config.preset.as_str())
        .opt("-threads", config.threads.to_string())
        .opt("-pix_fmt", "yuv420p")
        .opt("-g", gop.to_string())
        .opt("-keyint_min", gop.to_string())
        .opt("-sc_threshold", "0")
        .opt("-aspect", ladder.aspect());
    if let Some(tune) = &config.tune {
        cmd = cmd.opt("-tune", tune.as_str());
    }

    for (index, quality) in ladder.renditions.iter().enumerate() {
        cmd = cmd.output_args(rendition_args(index, quality));
    }

    let adaptation_sets = match info.audio_streams {
        0 => "id=0,streams=v",
        1 => {
            cmd = cmd.opt("-map", "0:a:0");
            "id=0,streams=v id=1,streams=a"
        }
        n => {
            let inputs: String = (0..n).map(|i| format!("[0:a:{}]", i)).collect();
            cmd = cmd
                .opt("-filter_complex", format!("{}amerge=inputs={}[aout]", inputs, n))
                .opt("-map", "[aout]");
            "id=0,streams=v id=1,streams=a"
        }
    };
    if info.audio_streams > 0 {
        cmd = cmd
            .opt("-c:a", "aac")
            .opt("-b:a", config.audio_bitrate.as_str())
            .opt("-ac", "2");
    }

    cmd.opt("-use_template", "1")
        .opt("-use_timeline", "1")
        .opt("-seg_duration", config.segment_seconds.to_string())
        .opt("-init_seg_name", "init-$RepresentationID$.m4s")
        .opt("-media_seg_name", "chunk-$RepresentationID$-$Number%05d$.m4s")
        .opt("-adaptation_sets", adaptation_sets)
        .opt("-f", "dash")
}

/// Process settings shared by every engine run
pub struct EngineProcess<'a> {
    pub binary: &'a Path,
    pub envs: &'a [(String, String)],
    pub kill_grace: Duration,
}

impl EngineProcess<'_> {
    /// Run one ffmpeg command to completion
    ///
    /// Every stderr line is handed to `on_line`. An abort signal stops the
    /// process (SIGTERM, then SIGKILL after the grace period) and returns
    /// `TranscodeError::Aborted`.
    pub async fn run<F>(
        &self,
        cmd: &FfmpegCommand,
        req: &mut TranscodeRequest,
        mut on_line: F,
    ) -> Result<(), TranscodeError>
    where
        F: FnMut(&str) + Send,
    {
        if let Some(reason) = req.abort_reason() {
            return Err(TranscodeError::Aborted(reason));
        }

        let args = cmd.build_args();
        debug!(clip_id = %req.clip_id, args = ?args, "Starting ffmpeg");

        let mut child = Command::new(self.binary)
            .args(&args)
            .env_clear()
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::SpawnFailed(format!("{}: {}", self.binary.display(), e)))?;
        req.report_pid(child.id());

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::SpawnFailed("stderr not captured".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !is_progress_line(&line) {
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.clone());
                        }
                        on_line(&line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(clip_id = %req.clip_id, error = %e, "Failed to read ffmpeg stderr");
                        break;
                    }
                },
                reason = aborted(&mut req.abort) => {
                    self.stop(&mut child).await;
                    return Err(TranscodeError::Aborted(reason));
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            reason = aborted(&mut req.abort) => {
                self.stop(&mut child).await;
                return Err(TranscodeError::Aborted(reason));
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(TranscodeError::EngineFailed {
                code: status.code(),
                stderr: tail.into_iter().collect::<Vec<_>>().join("\n"),
            })
        }
    }

    async fn stop(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            if let Err(e) = process::terminate(pid as i32) {
                warn!(pid = pid, error = %e, "Failed to signal ffmpeg");
            }
        }
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            warn!("ffmpeg ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill ffmpeg");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::ladder::{parse_presets, select, DEFAULT_QUALITY_PRESETS};

    fn info(audio_streams: usize) -> VideoInfo {
        VideoInfo {
            duration_secs: 10.0,
            width: 1280,
            height: 720,
            fps: 30.0,
            audio_streams,
        }
    }

    fn dash_args(audio_streams: usize) -> Vec<String> {
        let info = info(audio_streams);
        let presets = parse_presets(DEFAULT_QUALITY_PRESETS).unwrap();
        let ladder = select(&presets, info.width, info.height, info.fps);
        dash(
            &FfmpegConfig::default(),
            Path::new("/src/source"),
            &info,
            &ladder,
            Path::new("/out/manifest.mpd"),
        )
        .build_args()
    }

    fn value_of<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == key)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_command_layout() {
        let args = thumbnail(Path::new("in.mp4"), 1.0, Path::new("thumb.jpg")).build_args();
        let seek = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(seek < input);
        assert_eq!(args.last().unwrap(), "thumb.jpg");
        assert_eq!(value_of(&args, "-progress"), Some("pipe:2"));
    }

    #[test]
    fn test_dash_maps_one_video_stream_per_rung() {
        let args = dash_args(1);
        let video_maps = args.iter().filter(|a| *a == "0:v:0").count();
        assert_eq!(video_maps, 3);
        assert_eq!(value_of(&args, "-s:v:2"), Some("1280x720"));
        assert_eq!(value_of(&args, "-b:v:2"), Some("5.0M"));
        assert_eq!(value_of(&args, "-maxrate:v:2"), Some("6.0M"));
        assert_eq!(value_of(&args, "-g"), Some("60"));
        assert_eq!(value_of(&args, "-f"), Some("dash"));
        assert_eq!(
            value_of(&args, "-adaptation_sets"),
            Some("id=0,streams=v id=1,streams=a")
        );
        assert!(!args.iter().any(|a| a == "-filter_complex"));
    }

    #[test]
    fn test_dash_merges_multiple_audio_streams() {
        let args = dash_args(3);
        assert_eq!(
            value_of(&args, "-filter_complex"),
            Some("[0:a:0][0:a:1][0:a:2]amerge=inputs=3[aout]")
        );
        assert!(args.iter().any(|a| a == "[aout]"));
    }

    #[test]
    fn test_dash_without_audio() {
        let args = dash_args(0);
        assert_eq!(value_of(&args, "-adaptation_sets"), Some("id=0,streams=v"));
        assert!(!args.iter().any(|a| a == "-c:a"));
    }
}
