//! Shared application state.
//!
//! This module provides [`AppState`], which holds shared resources
//! across all HTTP request handlers.

use std::sync::Arc;

use wcgi_gateway_common::GatewayConfig;
use wcgi_gateway_core::engine::ScriptEngine;

use crate::gateway::Gateway;

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// The gateway core (caches + protocol bridges).
    gateway: Arc<Gateway>,
    /// Gateway configuration.
    config: Arc<GatewayConfig>,
}

impl AppState {
    /// Create new application state over the given execution engine.
    pub fn new(config: GatewayConfig, engine: Arc<dyn ScriptEngine>) -> Self {
        let gateway = Arc::new(Gateway::new(engine, &config.cache));
        Self {
            gateway,
            config: Arc::new(config),
        }
    }

    /// Get the gateway core.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Get the gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}
