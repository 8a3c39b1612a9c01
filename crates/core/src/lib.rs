// Clipcast Core - Domain Logic, Ports & Encoding Pipeline
// NO infrastructure dependencies: storage, processes and the clock are ports

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
