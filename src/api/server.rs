//! RPC Server
//!
//! Binds the RPC router to the configured loopback address and serves it
//! until the shutdown token fires.

use super::rpc::{build_router, Services};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct RpcServer {
    config: ServerConfig,
    services: Services,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(
        config: ServerConfig,
        services: Services,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            services,
            metrics,
            shutdown,
        }
    }

    /// Bind the configured endpoint and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.endpoint).await.map_err(|e| {
            Error::Configuration(format!("cannot bind RPC endpoint {}: {}", self.config.endpoint, e))
        })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let app = build_router(
            self.services,
            self.metrics,
            self.shutdown.clone(),
            self.config.request_timeout(),
        );

        info!(%addr, "RPC server listening");
        let shutdown = self.shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("RPC server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("RPC server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown; in-flight calls see their context cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::IdentityService;
    use crate::store::MemoryVolumeStore;

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let shutdown = CancellationToken::new();
        let services = Services {
            identity: Arc::new(IdentityService::new("jiva", Arc::new(MemoryVolumeStore::new()), false)),
            controller: None,
            node: None,
        };
        let server = RpcServer::new(
            ServerConfig::default(),
            services,
            Arc::new(Metrics::new().unwrap()),
            shutdown.clone(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(server.serve(listener));

        let response = reqwest::Client::new()
            .post(format!("http://{}/csi.v1.Identity/GetPluginInfo", addr))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        drop(response);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
