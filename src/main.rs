//! Gateway CLI entry point.
//!
//! Runs the HTTP front door over the wasmtime execution engine. In a
//! production deployment a FastCGI-speaking front end (nginx, etc.) sits in
//! front of this process and supplies the script environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wcgi_gateway_common::ConfigFile;
use wcgi_gateway_host::WasmtimeEngine;
use wcgi_gateway_server::{GatewayServer, ServerConfig};

/// FastCGI-style gateway executing WebAssembly scripts as CGI/WCGI handlers.
#[derive(Debug, Parser)]
#[command(name = "wcgi-gateway", version)]
struct Args {
    /// Listen address (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory scripts are resolved under (overrides the config file)
    #[arg(long)]
    document_root: Option<String>,

    /// Idle timeout for cached instances, in seconds
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Compiled artifact cache directory
    #[arg(long)]
    cache_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wcgi_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    if let Some(root) = args.document_root {
        config.gateway.scripts.document_root = root;
    }
    if let Some(ttl) = args.cache_ttl {
        config.gateway.cache.idle_timeout_secs = ttl;
    }
    if let Some(dir) = args.cache_dir {
        config.gateway.engine.cache_dir = Some(dir);
    }

    let bind_addr = match args.listen {
        Some(addr) => addr,
        None => config
            .server
            .listen
            .parse()
            .context("invalid listen address in config. Expected format: 'host:port'")?,
    };

    let server_config = ServerConfig {
        bind_addr,
        request_timeout_secs: config.server.request_timeout_secs,
        graceful_shutdown: config.server.graceful_shutdown,
    };

    info!(
        bind_addr = %bind_addr,
        document_root = %config.gateway.scripts.document_root,
        idle_timeout_secs = config.gateway.cache.idle_timeout_secs,
        "configuration loaded"
    );

    let engine = Arc::new(WasmtimeEngine::new(&config.gateway.engine)?);
    let server = GatewayServer::new(config.gateway, server_config, engine);

    server.run().await?;

    Ok(())
}
