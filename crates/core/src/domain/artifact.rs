// Artifact Domain Model
//
// Paths are relative to the clip's output directory so an artifact set can be
// moved from staging to its published location without rewriting it.

use crate::domain::ClipId;
use serde::{Deserialize, Serialize};

/// One bitrate rung of the DASH ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendition {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub init_segment: String,
    pub segments: Vec<String>,
}

/// Merged audio adaptation set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub index: u32,
    pub bitrate_kbps: u32,
    pub init_segment: String,
    pub segments: Vec<String>,
}

/// What the transcoding engine left in its sink directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeOutput {
    pub manifest: String,
    pub renditions: Vec<Rendition>,
    #[serde(default)]
    pub audio: Option<AudioTrack>,
    pub thumbnail: String,
}

impl TranscodeOutput {
    /// Every file the output consists of (manifest first)
    pub fn files(&self) -> Vec<&str> {
        let mut files = vec![self.manifest.as_str(), self.thumbnail.as_str()];
        for rendition in &self.renditions {
            files.push(rendition.init_segment.as_str());
            files.extend(rendition.segments.iter().map(String::as_str));
        }
        if let Some(audio) = &self.audio {
            files.push(audio.init_segment.as_str());
            files.extend(audio.segments.iter().map(String::as_str));
        }
        files
    }
}

/// A published, immutable set of streaming artifacts for a ready clip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub clip_id: ClipId,
    pub manifest: String,
    pub renditions: Vec<Rendition>,
    #[serde(default)]
    pub audio: Option<AudioTrack>,
    pub thumbnail: String,
    pub published_at: i64, // epoch ms
}

impl ArtifactSet {
    pub fn from_output(clip_id: impl Into<ClipId>, output: TranscodeOutput, published_at: i64) -> Self {
        Self {
            clip_id: clip_id.into(),
            manifest: output.manifest,
            renditions: output.renditions,
            audio: output.audio,
            thumbnail: output.thumbnail,
            published_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_lists_every_segment() {
        let output = TranscodeOutput {
            manifest: "manifest.mpd".to_string(),
            audio: None,
            thumbnail: "thumbnail.jpg".to_string(),
            renditions: vec![
                Rendition {
                    index: 0,
                    width: 640,
                    height: 360,
                    fps: 30,
                    bitrate_kbps: 1000,
                    init_segment: "init-0.m4s".to_string(),
                    segments: vec!["chunk-0-00001.m4s".to_string(), "chunk-0-00002.m4s".to_string()],
                },
                Rendition {
                    index: 1,
                    width: 1280,
                    height: 720,
                    fps: 30,
                    bitrate_kbps: 5000,
                    init_segment: "init-1.m4s".to_string(),
                    segments: vec!["chunk-1-00001.m4s".to_string()],
                },
            ],
        };

        let files = output.files();
        assert_eq!(files[0], "manifest.mpd");
        assert_eq!(files.len(), 7);
        assert!(files.contains(&"chunk-1-00001.m4s"));
    }
}
