//! CGI/WCGI protocol bridges, gateway orchestration, and HTTP server.
//!
//! This crate ties the workspace together:
//! - [`context`]: the structured per-request context (script path, working
//!   directory, policy rule, flags) passed explicitly to every component
//! - [`env`]: CGI environment construction per RFC 3875
//! - [`cgi`]: the classic one-shot bridge — one request, one instance, a
//!   header/body stream parsed back into an HTTP response
//! - [`tunnel`]: the persistent WCGI protocol — one long-lived instance
//!   serving many requests over a multiplexed session on its stdio pipes
//! - [`gateway`]: the orchestrator wiring the lifecycle caches to both
//!   protocol bridges
//! - [`handler`], [`router`], [`server`], [`state`]: the HTTP front door
//!   standing in for a FastCGI front end

pub mod cgi;
pub mod context;
pub mod env;
pub mod gateway;
pub mod handler;
pub mod router;
pub mod server;
pub mod state;
pub mod tunnel;

pub use context::{ForwardedClient, RequestContext};
pub use gateway::{Gateway, ModuleEntry, RedirectDelegate};
pub use router::build_router;
pub use server::{GatewayServer, ServerConfig, TestHandle};
pub use state::AppState;
pub use tunnel::TunnelSession;
