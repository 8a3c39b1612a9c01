//! ffprobe source inspection.

use clipcast_core::port::TranscodeError;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// What the encoder needs to know about a source
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub duration_secs: f64,
    /// Display width, after applying rotation
    pub width: u32,
    /// Display height, after applying rotation
    pub height: u32,
    pub fps: f64,
    pub audio_streams: usize,
}

impl VideoInfo {
    /// Thumbnail position: 1s in, or the middle of shorter clips
    pub fn thumbnail_offset(&self) -> f64 {
        if self.duration_secs > 2.0 {
            1.0
        } else {
            (self.duration_secs / 2.0).max(0.0)
        }
    }

    pub fn total_frames(&self) -> u64 {
        (self.duration_secs * self.fps).round().max(0.0) as u64
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Debug, Deserialize)]
struct SideData {
    rotation: Option<i32>,
}

pub(crate) fn probe_args(source: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-show_entries".to_string(),
        "format=duration:stream=codec_type,width,height,r_frame_rate,avg_frame_rate:stream_side_data=rotation"
            .to_string(),
        "-of".to_string(),
        "json".to_string(),
        source.to_string_lossy().to_string(),
    ]
}

/// Probe a source file
///
/// Anything that says the source itself is unusable maps to
/// `TranscodeError::SourceUnreadable`.
pub async fn probe(
    ffprobe: &Path,
    source: &Path,
    envs: &[(String, String)],
) -> Result<VideoInfo, TranscodeError> {
    if tokio::fs::metadata(source).await.is_err() {
        return Err(TranscodeError::SourceUnreadable(format!(
            "{} does not exist",
            source.display()
        )));
    }

    let output = Command::new(ffprobe)
        .args(probe_args(source))
        .env_clear()
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| TranscodeError::SpawnFailed(format!("ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(TranscodeError::SourceUnreadable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_probe_output(&output.stdout)
}

pub(crate) fn parse_probe_output(json: &[u8]) -> Result<VideoInfo, TranscodeError> {
    let probe: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| TranscodeError::SourceUnreadable(format!("unparseable ffprobe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| TranscodeError::SourceUnreadable("no video stream found".to_string()))?;

    let (mut width, mut height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(TranscodeError::SourceUnreadable(
                "video stream has no dimensions".to_string(),
            ))
        }
    };

    let rotation = video
        .side_data_list
        .iter()
        .find_map(|d| d.rotation)
        .unwrap_or(0)
        .rem_euclid(360);
    if rotation == 90 || rotation == 270 {
        std::mem::swap(&mut width, &mut height);
    }

    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(30.0);

    let duration_secs = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .unwrap_or(0.0);

    let audio_streams = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .count();

    Ok(VideoInfo {
        duration_secs,
        width,
        height,
        fps,
        audio_streams,
    })
}

/// Parse frame rate string (e.g., "30/1" or "29.97")
fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den <= 0.0 {
            return None;
        }
        num / den
    } else {
        s.parse().ok()?
    };
    (rate > 0.0).then_some(rate)
}
