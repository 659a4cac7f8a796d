use std::sync::Arc;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use storra_core::backend::StoreBackend;

use crate::{
    backend::Backend,
    config::StorraConfig,
    error::ServerResult,
    router::build_router,
};

/// The HTTP front end bound to one backend.
#[derive(Debug)]
pub struct StorraServer {
    config: StorraConfig,
    backend: Arc<Backend>,
}

impl StorraServer {
    pub fn new(config: StorraConfig, backend: Backend) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
        }
    }

    /// Builds the configured backend and wraps it in a server.
    pub async fn from_config(config: StorraConfig) -> ServerResult<Self> {
        let backend = Backend::from_config(&config).await?;

        Ok(Self::new(config, backend))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.backend), self.backend.kind().as_str())
    }

    /// Serves requests until Ctrl-C, then releases the backend connection.
    ///
    /// An unreachable backend at startup is logged and tolerated; requests report it.
    pub async fn serve(self) -> ServerResult<()> {
        let backend_name = self.backend.kind().as_str();
        match self.backend.check_available().await {
            Ok(()) => info!(backend = backend_name, "backend is available"),
            Err(err) => warn!(backend = backend_name, %err, "backend is not available yet"),
        }

        let addr = self.config.server.socket_addr();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, backend = backend_name, "storra listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("shutting down");
        self.backend.close_connection().await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
