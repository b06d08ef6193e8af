//! Configuration file structures for the wcgi-gateway.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::GatewayConfig;

/// Top-level configuration file structure.
///
/// This structure represents a complete TOML configuration file
/// that can be loaded at startup.
///
/// # Example
///
/// ```toml
/// [gateway.engine]
/// cache_compiled_modules = true
/// cache_dir = "./cache"
///
/// [gateway.cache]
/// idle_timeout_secs = 600
///
/// [gateway.scripts]
/// document_root = "/srv/wasm"
/// net_rule = "bypass=0.0.0.0/0&bypass=~10.0.0.5:9000"
///
/// [server]
/// listen = "127.0.0.1:7071"
/// request_timeout_secs = 30
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Gateway configuration (engine + cache + script settings).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Listen address (e.g., "127.0.0.1:7071").
    #[serde(default = "defaults::listen")]
    pub listen: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// Errors from configuration file loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the file that failed to load.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file could not be parsed as TOML.
    #[error("failed to parse config file: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },
}

/// Default value functions for serde.
mod defaults {
    pub fn listen() -> String {
        "127.0.0.1:7071".into()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }
}
