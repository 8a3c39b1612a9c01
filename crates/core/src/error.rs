//! Errors surfaced by the pipeline services.
//!
//! Engine failures never show up here: they are classified into a
//! `FailureKind` and recorded on the job instead.

use crate::domain::{ClipId, ClipState, JobId, JobState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid clip: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Clip {0} already has a live encode job")]
    DuplicateJob(ClipId),

    /// The clip reached Ready or Failed and only a delete may touch it now
    #[error("Clip {clip_id} is already {state}")]
    ClipSettled { clip_id: ClipId, state: ClipState },

    #[error("Job {job_id} is not claimed ({state})")]
    Unclaimed { job_id: JobId, state: JobState },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::port::StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

// sqlx::Error is mapped to AppError::Database inside infra-sqlite
