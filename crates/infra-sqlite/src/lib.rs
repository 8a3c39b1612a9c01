// Clipcast Infrastructure - SQLite Adapter
// Implements: JobQueue, ClipStore, Maintenance

mod clip_store;
mod connection;
mod error;
mod job_queue;
mod maintenance_impl;
mod migration;

pub use clip_store::SqliteClipStore;
pub use connection::create_pool;
pub use job_queue::SqliteJobQueue;
pub use maintenance_impl::SqliteMaintenance;
pub use migration::run_migrations;

// Note: sqlx::Error conversion goes through `error::map_sqlx_error`
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
