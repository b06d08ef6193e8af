//! Configuration structures for the wcgi-gateway.
//!
//! This module defines configuration options for various components:
//! - [`GatewayConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Execution engine settings (artifact caching)
//! - [`CacheConfig`]: Lifecycle cache settings (idle eviction)
//! - [`ScriptConfig`]: Per-script defaults (document root, policy rule, flags)

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
///
/// This structure contains all configuration options for the gateway core.
/// It can be loaded from files (TOML) or built programmatically.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Execution engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Lifecycle cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Script resolution and sandbox defaults.
    #[serde(default)]
    pub scripts: ScriptConfig,
}

/// Execution engine configuration.
///
/// These settings affect compilation of WebAssembly scripts and the
/// persistence of compiled artifacts across process restarts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the on-disk cache of compiled artifacts.
    ///
    /// The artifact cache is purely a speed optimization for recompilation
    /// across process restarts; it is never required for correctness.
    #[serde(default = "defaults::cache_compiled_modules")]
    pub cache_compiled_modules: bool,

    /// Directory for the compiled artifact cache.
    ///
    /// Only effective when `cache_compiled_modules` is enabled.
    #[serde(default)]
    pub cache_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_compiled_modules: defaults::cache_compiled_modules(),
            cache_dir: Some("./cache".into()),
        }
    }
}

/// Lifecycle cache configuration.
///
/// These settings control how long compiled code and running module
/// instances stay warm between requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Idle timeout in seconds for a script's instance entry.
    ///
    /// An entry not touched by any request for this long is evicted, which
    /// transitively closes its tunnel session and releases its compiled
    /// module reference.
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: defaults::idle_timeout_secs(),
        }
    }
}

impl CacheConfig {
    /// Get the idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Script resolution and sandbox defaults.
///
/// When the gateway fronts plain HTTP (rather than receiving per-request
/// FastCGI parameters), these values supply the environment keys a FastCGI
/// front end would normally provide: `DOCUMENT_ROOT`, `WASI_NET`,
/// `WASI_DEBUG` and `WASI_CGI`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptConfig {
    /// Directory scripts are resolved under, and the directory mounted into
    /// the module's filesystem view.
    #[serde(default = "defaults::document_root")]
    pub document_root: String,

    /// Root URI prefix of the handler.
    #[serde(default = "defaults::script_name")]
    pub script_name: String,

    /// Network policy rule string (`WASI_NET`). Empty denies all outbound
    /// connections.
    #[serde(default)]
    pub net_rule: String,

    /// Surface the module's own error stream (`WASI_DEBUG`).
    #[serde(default)]
    pub debug: bool,

    /// Force classic one-shot CGI execution even when the module supports
    /// the persistent protocol (`WASI_CGI`).
    #[serde(default)]
    pub force_classic: bool,

    /// Host environment variables to pass through to scripts, by name.
    #[serde(default)]
    pub inherit_env: Vec<String>,

    /// Extra environment variables for scripts; these win on conflict.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            document_root: defaults::document_root(),
            script_name: defaults::script_name(),
            net_rule: String::new(),
            debug: false,
            force_classic: false,
            inherit_env: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn cache_compiled_modules() -> bool {
        true
    }

    pub const fn idle_timeout_secs() -> u64 {
        600
    }

    pub fn document_root() -> String {
        ".".into()
    }

    pub fn script_name() -> String {
        "/".into()
    }
}
