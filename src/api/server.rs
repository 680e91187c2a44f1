//! API Server

use super::{handlers::AppState, routes::create_app};
use crate::config::ServerConfig;
use crate::engine::GameEngine;
use crate::identity::{HeaderIdentity, IdentityResolver};
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tracing::{error, info};

pub struct ApiServer {
    config: ServerConfig,
    engine: Arc<GameEngine>,
    identity: Arc<dyn IdentityResolver>,
}

impl ApiServer {
    pub fn new(config: ServerConfig, engine: Arc<GameEngine>) -> Self {
        Self {
            config,
            engine,
            identity: Arc::new(HeaderIdentity),
        }
    }

    /// Swap the identity resolver
    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    /// The fully layered application router
    pub fn app(&self) -> axum::Router {
        let state = Arc::new(AppState {
            engine: Arc::clone(&self.engine),
            identity: Arc::clone(&self.identity),
            admin_key: self.config.admin_key.clone(),
        });
        create_app(
            state,
            &self.config.allowed_origins,
            std::time::Duration::from_secs(self.config.request_timeout_secs),
        )
    }

    /// Serve until ctrl-c or SIGTERM
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.app();
        let addr = self.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!(
            listen = %addr,
            modes = self.engine.mode_ids().len(),
            admin_key = self.config.admin_key.is_some(),
            timeout_secs = self.config.request_timeout_secs,
            "API server running"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("API server stopped gracefully");
        Ok(())
    }

    fn socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(SocketAddr::from((
            self.config.host.parse::<std::net::IpAddr>()?,
            self.config.port,
        )))
    }
}

/// Wait for shutdown signal
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
