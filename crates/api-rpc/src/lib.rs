//! JSON-RPC API Layer
//!
//! Exposes clip intake, progress polling and admin operations as
//! versioned JSON-RPC 2.0 methods.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use handler::RpcHandler;
pub use server::{RpcServer, RpcServerConfig};
