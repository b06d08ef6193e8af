//! Persistent WCGI tunnel protocol.
//!
//! Instead of paying module-startup cost per request, a tunnel session
//! keeps one module instance alive and multiplexes HTTP traffic to it over
//! the instance's own standard input/output: the host and the instance
//! share an in-process duplex byte channel, the instance serves HTTP on
//! its end, and the host drives an HTTP/2 client connection on the other.
//!
//! Each inbound request opens one multiplexed stream as a reverse-proxied
//! call to a synthetic fixed authority — the session, not DNS or TCP,
//! determines the real destination. Concurrent requests open independent
//! streams with no implicit serialization.
//!
//! All teardown paths funnel through one cancellation scope: the instance
//! finishing (success or trap), the transport reporting itself closed, the
//! owning instance entry's scope closing, or a session construction error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::header::HeaderName;
use http::{Request, Response, Uri};
use hyper::client::conn::http2::SendRequest;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wcgi_gateway_common::GatewayError;
use wcgi_gateway_core::engine::{
    CompiledScript, InstanceSpec, StderrSpec, StdinSpec, StdoutSpec, TUNNEL_ENV,
};
use wcgi_gateway_core::fingerprint::SessionKey;

use crate::context::RequestContext;

/// Synthetic authority requests are proxied to; the multiplexed session is
/// the real destination.
pub const TUNNEL_AUTHORITY: &str = "wcgi.tunnel";

/// Keep-alive ping interval on an established session.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// How long an unanswered keep-alive ping is tolerated.
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on opening a new stream, and on the initial session probe.
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the duplex byte channel between host and instance.
const PIPE_CAPACITY: usize = 256 * 1024;

/// One running module instance plus the multiplexed transport wrapping its
/// stdio pipes.
pub struct TunnelSession {
    sender: SendRequest<Body>,
    scope: CancellationToken,
    key: SessionKey,
}

impl TunnelSession {
    /// Proxy one request through a fresh multiplexed stream.
    pub async fn proxy(&self, req: Request<Body>) -> Result<Response<Body>, GatewayError> {
        let (parts, body) = req.into_parts();

        let uri = tunnel_uri(&parts.uri).map_err(GatewayError::tunnel)?;
        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &parts.headers {
                if name == http::header::HOST || is_hop_by_hop(name) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
        }
        let tunneled = builder
            .body(body)
            .map_err(|e| GatewayError::tunnel(e.to_string()))?;

        let mut sender = self.sender.clone();
        timeout(STREAM_OPEN_TIMEOUT, sender.ready())
            .await
            .map_err(|_| GatewayError::tunnel("stream open timed out"))?
            .map_err(|e| GatewayError::tunnel(e.to_string()))?;

        let response = sender
            .send_request(tunneled)
            .await
            .map_err(|e| GatewayError::tunnel(e.to_string()))?;

        let (parts, incoming) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(incoming)))
    }

    /// Close the session. Safe to call any number of times.
    pub fn close(&self) {
        self.scope.cancel();
    }

    /// Returns `true` once the session's scope has been cancelled.
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// The key this session was created under.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("key", &self.key.to_string())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Launch a module instance in persistent mode and wrap its stdio pipes in
/// a multiplexed client session.
///
/// `on_close` fires exactly once when the session's scope closes, whatever
/// triggered the closure; the gateway uses it to drop the session from its
/// cache so a later request re-creates one.
pub(crate) async fn establish(
    script: Arc<dyn CompiledScript>,
    ctx: &RequestContext,
    mut env: BTreeMap<String, String>,
    key: SessionKey,
    parent: &CancellationToken,
    on_close: impl FnOnce() + Send + 'static,
) -> Result<Arc<TunnelSession>, GatewayError> {
    let scope = parent.child_token();

    let (host_io, guest_io) = tokio::io::duplex(PIPE_CAPACITY);
    let (guest_stdin, guest_stdout) = tokio::io::split(guest_io);

    env.insert(TUNNEL_ENV.into(), "true".into());
    let spec = InstanceSpec {
        args: vec![ctx.script_path.display().to_string()],
        env: env.into_iter().collect(),
        stdin: StdinSpec::Reader(Box::new(guest_stdin)),
        stdout: StdoutSpec::Writer(Box::new(guest_stdout)),
        stderr: if ctx.debug {
            StderrSpec::Inherit
        } else {
            StderrSpec::Discard
        },
        workdir: ctx.workdir.clone(),
        net_rule: if ctx.net_rule.is_empty() {
            None
        } else {
            Some(ctx.net_rule.clone())
        },
    };

    // Run the instance; its completion, success or trap, closes the scope.
    // Scope closure in turn drops the start future, asking the engine to
    // stop the instance.
    let run_scope = scope.clone();
    let run_key = key.to_string();
    tokio::spawn(async move {
        tokio::select! {
            outcome = script.start(spec) => match outcome {
                Ok(outcome) => info!(session = %run_key, ?outcome, "tunnel instance finished"),
                Err(error) => warn!(session = %run_key, %error, "tunnel instance failed"),
            },
            () = run_scope.cancelled() => {}
        }
        run_scope.cancel();
    });

    // Client half of the multiplexing protocol over the host-facing pipe
    // ends, with periodic keep-alive pings.
    let mut builder = hyper::client::conn::http2::Builder::new(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .keep_alive_interval(KEEP_ALIVE_INTERVAL)
        .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
        .keep_alive_while_idle(true);

    let handshake = timeout(
        STREAM_OPEN_TIMEOUT,
        builder.handshake::<_, Body>(TokioIo::new(host_io)),
    )
    .await;
    let (mut sender, connection) = match handshake {
        Ok(Ok(pair)) => pair,
        Ok(Err(error)) => {
            scope.cancel();
            return Err(GatewayError::tunnel(format!("handshake failed: {error}")));
        }
        Err(_) => {
            scope.cancel();
            return Err(GatewayError::tunnel("handshake timed out"));
        }
    };

    // Drive the transport; it reporting itself closed closes the scope.
    let conn_scope = scope.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = connection => {
                if let Err(error) = result {
                    debug!(%error, "tunnel transport closed");
                }
            }
            () = conn_scope.cancelled() => {}
        }
        conn_scope.cancel();
    });

    // Initial probe: confirm the instance side is responsive before the
    // session is marked usable.
    let probe = timeout(STREAM_OPEN_TIMEOUT, sender.ready()).await;
    match probe {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            scope.cancel();
            return Err(GatewayError::tunnel(format!("session probe failed: {error}")));
        }
        Err(_) => {
            scope.cancel();
            return Err(GatewayError::tunnel("session probe timed out"));
        }
    }

    let session = Arc::new(TunnelSession {
        sender,
        scope: scope.clone(),
        key: key.clone(),
    });

    tokio::spawn(async move {
        scope.cancelled().await;
        on_close();
        debug!(session = %key, "tunnel session closed");
    });

    Ok(session)
}

/// Rewrite a request URI onto the synthetic tunnel endpoint.
fn tunnel_uri(uri: &Uri) -> Result<Uri, String> {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    Uri::builder()
        .scheme("http")
        .authority(TUNNEL_AUTHORITY)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| e.to_string())
}

/// Hop-by-hop headers never forwarded onto a tunneled stream.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
