//! Web server for TeleStore.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::{Result, TelestoreError};

use super::handlers::AppState;
use super::router::{create_health_router, create_router, create_swagger_router};

/// Build the complete application router.
pub fn build_app(app_state: Arc<AppState>, cors_origins: &[String]) -> Router {
    create_router(app_state, cors_origins)
        .merge(create_health_router())
        .merge(create_swagger_router())
}

/// Web server for the transfer API.
pub struct WebServer {
    /// Server address.
    addr: SocketAddr,
    /// Application state.
    app_state: Arc<AppState>,
    /// Allowed CORS origins.
    cors_origins: Vec<String>,
}

impl WebServer {
    /// Create a new web server.
    pub fn new(config: &ServerConfig, app_state: Arc<AppState>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| TelestoreError::Config(format!("invalid server address: {e}")))?;

        Ok(Self {
            addr,
            app_state,
            cors_origins: config.cors_origins.clone(),
        })
    }

    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the retention sweeper.
    ///
    /// Removes finished jobs and idle upload sessions on every tick.
    fn start_cleanup_task(state: Arc<AppState>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.retention.interval);

            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                state.sweep().await;
            }
        });
    }

    fn bind_app(&self) -> Router {
        build_app(Arc::clone(&self.app_state), &self.cors_origins)
    }

    /// Run the web server.
    pub async fn run(self) -> std::result::Result<(), std::io::Error> {
        let router = self.bind_app();

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        // Start the sweeper after a successful bind
        Self::start_cleanup_task(Arc::clone(&self.app_state));
        tracing::info!(
            interval_secs = self.app_state.retention.interval.as_secs(),
            "Retention sweeper started"
        );

        tracing::info!("Web server listening on http://{}", local_addr);

        axum::serve(listener, router).await
    }

    /// Run the server and return the actual bound address.
    ///
    /// This is useful for testing when binding to port 0.
    pub async fn run_with_addr(self) -> std::result::Result<SocketAddr, std::io::Error> {
        let router = self.bind_app();

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        Self::start_cleanup_task(Arc::clone(&self.app_state));
        tracing::info!("Web server listening on http://{}", local_addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Web server error: {}", e);
            }
        });

        Ok(local_addr)
    }
}
