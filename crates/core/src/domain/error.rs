// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid clip state transition: {from} -> {to}")]
    InvalidClipTransition { from: String, to: String },

    #[error("Invalid clip id: {0}")]
    InvalidClipId(String),

    #[error("Progress value out of range: {0} (expected -2..=100)")]
    InvalidProgress(i32),

    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, DomainError>;
