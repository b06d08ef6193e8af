//! HTTP server implementation.
//!
//! This module provides the main [`GatewayServer`] struct for running the
//! gateway's HTTP front door. The FastCGI transport a production deployment
//! would sit behind is a collaborator; from the core's perspective inbound
//! is one call per HTTP request, which this server supplies directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use wcgi_gateway_common::{GatewayConfig, GatewayError};
use wcgi_gateway_core::engine::ScriptEngine;

use crate::router::build_router;
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7071".parse().unwrap(),
            request_timeout_secs: 30,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with custom bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The gateway HTTP server.
///
/// # Example
///
/// ```ignore
/// use wcgi_gateway_common::GatewayConfig;
/// use wcgi_gateway_host::WasmtimeEngine;
/// use wcgi_gateway_server::{GatewayServer, ServerConfig};
///
/// let config = GatewayConfig::default();
/// let engine = Arc::new(WasmtimeEngine::new(&config.engine)?);
/// let server = GatewayServer::new(config, ServerConfig::default(), engine);
/// server.run().await?;
/// ```
pub struct GatewayServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
}

impl GatewayServer {
    /// Create a new server instance over the given execution engine.
    pub fn new(
        gateway_config: GatewayConfig,
        server_config: ServerConfig,
        engine: Arc<dyn ScriptEngine>,
    ) -> Self {
        let state = AppState::new(gateway_config, engine);
        Self {
            state,
            config: server_config,
        }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), GatewayError> {
        let app = build_router(self.state.clone(), self.config.request_timeout());
        let service = app.into_make_service_with_connect_info::<SocketAddr>();

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| GatewayError::invalid_config(format!("failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, "gateway server running");

        if self.config.graceful_shutdown {
            axum::serve(listener, service)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| GatewayError::invalid_config(format!("server error: {e}")))?;
        } else {
            axum::serve(listener, service)
                .await
                .map_err(|e| GatewayError::invalid_config(format!("server error: {e}")))?;
        }

        // Close every cached session before the process exits.
        self.state.gateway().shut_down();

        info!("server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral port and return a handle for tests.
    pub async fn start_test(
        gateway_config: GatewayConfig,
        engine: Arc<dyn ScriptEngine>,
    ) -> Result<TestHandle, GatewayError> {
        let state = AppState::new(gateway_config, engine);
        let app = build_router(state.clone(), Duration::from_secs(30));
        let service = app.into_make_service_with_connect_info::<SocketAddr>();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| GatewayError::invalid_config(format!("failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::invalid_config(format!("failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, service)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state.
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
        self.state.gateway().shut_down();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
