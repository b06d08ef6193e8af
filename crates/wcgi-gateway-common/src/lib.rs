//! Common types, errors, and configuration for wcgi-gateway.
//!
//! This crate provides shared functionality used across the wcgi-gateway workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for gateway settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{CacheConfig, EngineConfig, GatewayConfig, ScriptConfig};
pub use config_file::{ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{CgiError, EngineError, GatewayError};
