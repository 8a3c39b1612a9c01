//! JSON-RPC Server
//!
//! JSON-RPC 2.0 over TCP, bound to localhost by default.

use crate::error::ServerError;
use crate::handler::RpcHandler;
use crate::types::{CancelRequest, EnqueueRequest, MaintenanceRequest, ProgressRequest, StatusRequest};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::RpcModule;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9630;

/// RPC Server Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

impl RpcServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: Arc<RpcHandler>,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, handler: Arc<RpcHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind and start serving. The returned handle stops the server.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let addr = self.config.addr();

        info!(
            host = %self.config.host,
            port = self.config.port,
            "Starting JSON-RPC server"
        );

        let server = Server::builder()
            .build(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let mut module = RpcModule::new(());

        let handler = self.handler.clone();
        module
            .register_async_method("clips.enqueue.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: EnqueueRequest = params.parse()?;
                    handler.enqueue(req).await
                }
            })
            .map_err(|e| register_error("clips.enqueue.v1", e))?;

        let handler = self.handler.clone();
        module
            .register_async_method("clips.progress.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: ProgressRequest = params.parse()?;
                    handler.progress(req).await
                }
            })
            .map_err(|e| register_error("clips.progress.v1", e))?;

        let handler = self.handler.clone();
        module
            .register_async_method("clips.cancel.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: CancelRequest = params.parse()?;
                    handler.cancel(req).await
                }
            })
            .map_err(|e| register_error("clips.cancel.v1", e))?;

        let handler = self.handler.clone();
        module
            .register_async_method("clips.status.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: StatusRequest = params.parse()?;
                    handler.status(req).await
                }
            })
            .map_err(|e| register_error("clips.status.v1", e))?;

        // Admin APIs
        let handler = self.handler.clone();
        module
            .register_async_method("admin.stats.v1", move |_, _, _| {
                let handler = handler.clone();
                async move { handler.stats().await }
            })
            .map_err(|e| register_error("admin.stats.v1", e))?;

        let handler = self.handler.clone();
        module
            .register_async_method("admin.maintenance.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: Option<MaintenanceRequest> = params.parse()?;
                    handler.maintenance(req.unwrap_or_default()).await
                }
            })
            .map_err(|e| register_error("admin.maintenance.v1", e))?;

        let local_addr = server.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!(addr = %local_addr, "JSON-RPC server started");

        Ok(server.start(module))
    }
}

fn register_error(method: &'static str, err: impl std::fmt::Display) -> ServerError {
    ServerError::Register {
        method,
        message: err.to_string(),
    }
}
