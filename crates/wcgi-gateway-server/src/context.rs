//! Structured per-request context.
//!
//! Rather than threading ad hoc environment-variable maps through the
//! gateway, everything a component needs to know about the current request
//! is captured once in a [`RequestContext`] and passed explicitly.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use wcgi_gateway_common::ScriptConfig;

/// Everything the gateway needs to know about one request, resolved once.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Absolute path of the script to execute (`SCRIPT_FILENAME`).
    pub script_path: PathBuf,
    /// Root URI prefix of the handler (`SCRIPT_NAME`).
    pub script_name: String,
    /// Directory mounted into the module's filesystem view
    /// (`DOCUMENT_ROOT`).
    pub workdir: Option<PathBuf>,
    /// Network policy rule string (`WASI_NET`); empty denies everything.
    pub net_rule: String,
    /// Surface the module's error stream (`WASI_DEBUG`).
    pub debug: bool,
    /// Force classic one-shot execution (`WASI_CGI`).
    pub force_classic: bool,
    /// Address of the HTTP client, if known.
    pub remote_addr: Option<SocketAddr>,
    /// Whether the client connection was encrypted.
    pub tls: bool,
    /// Caller-supplied extra environment variables; win on conflict.
    pub extra_env: BTreeMap<String, String>,
    /// Host environment variables passed through by name.
    pub inherit_env: Vec<String>,
}

impl RequestContext {
    /// Build a context from script configuration plus per-request facts.
    pub fn new(config: &ScriptConfig, script_path: PathBuf) -> Self {
        Self {
            script_path,
            script_name: config.script_name.clone(),
            workdir: Some(PathBuf::from(&config.document_root)),
            net_rule: config.net_rule.clone(),
            debug: config.debug,
            force_classic: config.force_classic,
            remote_addr: None,
            tls: false,
            extra_env: config.env.clone(),
            inherit_env: config.inherit_env.clone(),
        }
    }

    /// Attach the client's address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Mark the client connection as encrypted.
    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

/// Client facts carried into an internally redirected request.
///
/// Attached as a request extension on the synthetic GET dispatched to a
/// redirect delegate, mirroring how an HTTP redirect preserves who the
/// client is but nothing else about the original request.
#[derive(Debug, Clone, Copy)]
pub struct ForwardedClient {
    /// Address of the original HTTP client.
    pub remote_addr: Option<SocketAddr>,
    /// Whether the original connection was encrypted.
    pub tls: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_config() {
        let config = ScriptConfig {
            document_root: "/srv/wasm".into(),
            net_rule: "bypass=0.0.0.0/0".into(),
            debug: true,
            ..ScriptConfig::default()
        };

        let ctx = RequestContext::new(&config, "/srv/wasm/app.wasm".into());

        assert_eq!(ctx.script_path, PathBuf::from("/srv/wasm/app.wasm"));
        assert_eq!(ctx.workdir, Some(PathBuf::from("/srv/wasm")));
        assert_eq!(ctx.net_rule, "bypass=0.0.0.0/0");
        assert!(ctx.debug);
        assert!(!ctx.force_classic);
        assert!(ctx.remote_addr.is_none());
    }

    #[test]
    fn test_context_builders() {
        let config = ScriptConfig::default();
        let addr: SocketAddr = "10.0.0.1:41000".parse().unwrap();

        let ctx = RequestContext::new(&config, "app.wasm".into())
            .with_remote_addr(addr)
            .with_tls(true);

        assert_eq!(ctx.remote_addr, Some(addr));
        assert!(ctx.tls);
    }
}
