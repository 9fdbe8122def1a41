//! REST API Server
//!
//! Serves the REST router until the shared cancellation token fires.

use crate::error::{Error, Result};
use crate::reconcile::scheduler::ScanScheduler;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

/// REST API server bound to one scheduler
pub struct ApiServer {
    config: ApiServerConfig,
    scheduler: Arc<ScanScheduler>,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        scheduler: Arc<ScanScheduler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            scheduler,
            shutdown,
        }
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.rest_addr;
        let app = RestRouter::new(self.scheduler.clone()).build();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

        info!("REST API listening on {}", addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::InventorySide;
    use crate::reconcile::engine::{EngineConfig, ReconciliationEngine};
    use crate::sources::MemoryInventory;
    use crate::store::FindingsStore;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let engine = ReconciliationEngine::new(
            EngineConfig::default(),
            MemoryInventory::new(InventorySide::Cluster, "cluster"),
            MemoryInventory::new(InventorySide::Backend, "backend"),
            FindingsStore::new(),
        )
        .unwrap();
        let scheduler =
            ScanScheduler::new(engine, Duration::from_secs(60), CancellationToken::new()).unwrap();

        let config = ApiServerConfig {
            rest_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        };
        let server = ApiServer::new(config, scheduler, CancellationToken::new());
        server.shutdown();

        tokio::time::timeout(Duration::from_secs(5), server.run())
            .await
            .unwrap()
            .unwrap();
    }
}
