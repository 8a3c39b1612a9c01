//! RPC Error Types
//!
//! Maps application errors to JSON-RPC error codes.

use clipcast_core::error::AppError;
use clipcast_core::port::StorageError;
use jsonrpsee::types::ErrorObjectOwned;
use serde_json::{json, Value};
use thiserror::Error;

/// RPC Error Codes
pub mod code {
    pub const VALIDATION_ERROR: i32 = 4000;
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4002;
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const DB_ERROR: i32 = 5001;
    pub const SYSTEM_ERROR: i32 = 5002;
}

/// Server startup failures
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to register method {method}: {message}")]
    Register {
        method: &'static str,
        message: String,
    },
}

fn owned(code: i32, message: impl Into<String>) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, message.into(), None::<()>)
}

/// Error carrying machine-readable context for clients
fn with_data(code: i32, message: impl Into<String>, data: Value) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, message.into(), Some(data))
}

/// Convert AppError to JSON-RPC ErrorObject
pub fn to_rpc_error(err: AppError) -> ErrorObjectOwned {
    let message = err.to_string();
    match err {
        AppError::Validation(msg) => owned(code::VALIDATION_ERROR, msg),
        AppError::Domain(e) => owned(code::VALIDATION_ERROR, e.to_string()),
        AppError::NotFound(msg) => owned(code::NOT_FOUND, msg),
        AppError::Storage(StorageError::SourceMissing(clip_id)) => {
            with_data(code::NOT_FOUND, message, json!({ "clip_id": clip_id }))
        }
        AppError::DuplicateJob(clip_id) => {
            with_data(code::CONFLICT, message, json!({ "clip_id": clip_id }))
        }
        AppError::ClipSettled { clip_id, state } => with_data(
            code::CONFLICT,
            message,
            json!({ "clip_id": clip_id, "state": state }),
        ),
        AppError::Unclaimed { job_id, state } => with_data(
            code::CONFLICT,
            message,
            json!({ "job_id": job_id, "state": state }),
        ),
        AppError::Database(msg) => owned(code::DB_ERROR, msg),
        AppError::Storage(_) => owned(code::SYSTEM_ERROR, message),
        AppError::Config(msg) => owned(code::INTERNAL_ERROR, msg),
    }
}
