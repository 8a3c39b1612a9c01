// Domain Layer - Pure business logic and entities

pub mod artifact;
pub mod clip;
pub mod error;
pub mod job;
pub mod progress;

// Re-exports
pub use artifact::{ArtifactSet, AudioTrack, Rendition, TranscodeOutput};
pub use clip::{validate_clip_id, ClipId, ClipState};
pub use error::DomainError;
pub use job::{EncodeJob, FailureKind, JobId, JobPhase, JobState};
pub use progress::{
    percent_from_fraction, validate_progress, PROGRESS_COMPLETE, PROGRESS_ENCODING_CEILING,
    PROGRESS_FAILED, PROGRESS_QUEUED,
};
