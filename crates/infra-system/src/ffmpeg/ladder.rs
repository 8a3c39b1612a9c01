//! Quality ladder selection.

use super::FfmpegSetupError;
use std::str::FromStr;

/// Presets used when none are configured, lowest first
pub const DEFAULT_QUALITY_PRESETS: &str = "640x360-30@1,854x480-30@2.5,1280x720-30@5,1920x1080-30@8,1920x1080-60@12,2560x1440-30@16,2560x1440-60@24,3840x2160-30@45,3840x2160-60@68";

/// Engine-side floor for the frame rate compared against presets
const MIN_LADDER_FPS: u32 = 30;

/// One rung of the ladder, always expressed in landscape orientation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quality {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_mbps: f32,
}

impl Quality {
    pub fn bitrate_kbps(&self) -> u32 {
        (self.bitrate_mbps * 1000.0).round() as u32
    }
}

impl FromStr for Quality {
    type Err = FfmpegSetupError;

    /// Parse `WxH-FPS@Mbps`, e.g. `1280x720-30@5`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FfmpegSetupError::InvalidPreset(s.to_string());
        let s_trimmed = s.trim();

        let (size, rest) = s_trimmed.split_once('-').ok_or_else(invalid)?;
        let (fps, bitrate) = rest.split_once('@').ok_or_else(invalid)?;
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;

        let quality = Quality {
            width: width.parse().map_err(|_| invalid())?,
            height: height.parse().map_err(|_| invalid())?,
            fps: fps.parse().map_err(|_| invalid())?,
            bitrate_mbps: bitrate.parse().map_err(|_| invalid())?,
        };

        if quality.width == 0 || quality.height == 0 || quality.fps == 0 || quality.bitrate_mbps <= 0.0 {
            return Err(invalid());
        }
        Ok(quality)
    }
}

/// Parse a comma separated preset list, ordered lowest quality first
pub fn parse_presets(list: &str) -> Result<Vec<Quality>, FfmpegSetupError> {
    let mut presets = list
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(Quality::from_str)
        .collect::<Result<Vec<_>, _>>()?;

    if presets.is_empty() {
        return Err(FfmpegSetupError::NoPresets);
    }

    presets.sort_by(|a, b| {
        (a.width * a.height, a.fps)
            .cmp(&(b.width * b.height, b.fps))
            .then(a.bitrate_mbps.total_cmp(&b.bitrate_mbps))
    });
    Ok(presets)
}

/// Renditions chosen for one source
#[derive(Debug, Clone, PartialEq)]
pub struct Ladder {
    /// Output sizes, already swapped for vertical sources
    pub renditions: Vec<Quality>,
    pub vertical: bool,
}

impl Ladder {
    pub fn aspect(&self) -> &'static str {
        if self.vertical {
            "9:16"
        } else {
            "16:9"
        }
    }
}

/// Keep the presets that fit inside the source. Falls back to the lowest
/// preset when the source is smaller than all of them.
pub fn select(presets: &[Quality], width: u32, height: u32, fps: f64) -> Ladder {
    let fps = (fps.round() as u32).max(MIN_LADDER_FPS);
    let vertical = height > width;
    let (long, short) = if vertical { (height, width) } else { (width, height) };

    let mut renditions: Vec<Quality> = presets
        .iter()
        .filter(|p| p.width <= long && p.height <= short && p.fps <= fps)
        .copied()
        .collect();

    if renditions.is_empty() {
        renditions.extend(presets.first().copied());
    }

    if vertical {
        for q in &mut renditions {
            std::mem::swap(&mut q.width, &mut q.height);
        }
    }

    Ladder {
        renditions,
        vertical,
    }
}
