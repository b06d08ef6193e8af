//! Scriptable in-memory execution engine for gateway tests.
//!
//! The mock treats the "script file" bytes as the module's scripted CGI
//! output: a classic start replays them on stdout (appending any request
//! body it was given on stdin), while a persistent start serves HTTP/2 on
//! its stdio pipes, echoing each stream's path and body back. Compiles and
//! live instances are counted so caching and eviction are observable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::AsyncWriteExt;

use wcgi_gateway_common::EngineError;
use wcgi_gateway_core::engine::{
    CompiledScript, InstanceOutcome, InstanceSpec, ScriptCapability, ScriptEngine, StdinSpec,
    StdoutSpec, TUNNEL_ENV,
};

/// Counting, scriptable engine double.
pub struct MockEngine {
    compiles: AtomicUsize,
    live: Arc<AtomicUsize>,
    trap: Arc<AtomicBool>,
    fail_compile: AtomicBool,
    capability: ScriptCapability,
}

impl MockEngine {
    /// An engine whose modules only support classic execution.
    pub fn classic() -> Arc<Self> {
        Arc::new(Self::with_capability(ScriptCapability::ClassicOnly))
    }

    /// An engine whose modules export the persistent entry point.
    pub fn tunnel() -> Arc<Self> {
        Arc::new(Self::with_capability(ScriptCapability::PersistentTunnel))
    }

    fn with_capability(capability: ScriptCapability) -> Self {
        Self {
            compiles: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            trap: Arc::new(AtomicBool::new(false)),
            fail_compile: AtomicBool::new(false),
            capability,
        }
    }

    /// How many times `compile` ran.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    /// How many instances are currently running.
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Make every started instance trap immediately.
    pub fn set_trap(&self, on: bool) {
        self.trap.store(on, Ordering::SeqCst);
    }

    /// Make the next compiles fail.
    pub fn set_fail_compile(&self, on: bool) {
        self.fail_compile.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScriptEngine for MockEngine {
    async fn compile(&self, bytes: Vec<u8>) -> Result<Arc<dyn CompiledScript>, EngineError> {
        if self.fail_compile.load(Ordering::SeqCst) {
            return Err(EngineError::compilation("scripted compile failure"));
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockScript {
            bytes,
            capability: self.capability,
            live: self.live.clone(),
            trap: self.trap.clone(),
        }))
    }
}

struct MockScript {
    bytes: Vec<u8>,
    capability: ScriptCapability,
    live: Arc<AtomicUsize>,
    trap: Arc<AtomicBool>,
}

/// Decrements the live-instance count when the start future is dropped,
/// including drops caused by scope cancellation.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompiledScript for MockScript {
    fn capability(&self) -> ScriptCapability {
        self.capability
    }

    async fn start(&self, spec: InstanceSpec) -> Result<InstanceOutcome, EngineError> {
        self.live.fetch_add(1, Ordering::SeqCst);
        let _guard = LiveGuard(self.live.clone());

        if self.trap.load(Ordering::SeqCst) {
            return Ok(InstanceOutcome::Trapped {
                message: "scripted trap".into(),
            });
        }

        let persistent = spec
            .env
            .iter()
            .any(|(key, value)| key == TUNNEL_ENV && value == "true");
        if persistent {
            serve_tunnel(spec).await
        } else {
            replay_classic(self.bytes.clone(), spec).await
        }
    }
}

/// Classic mode: scripted output, then any stdin bytes, then EOF.
async fn replay_classic(
    output: Vec<u8>,
    spec: InstanceSpec,
) -> Result<InstanceOutcome, EngineError> {
    let StdoutSpec::Writer(mut writer) = spec.stdout else {
        return Ok(InstanceOutcome::Completed);
    };

    writer.write_all(&output).await.ok();
    if let StdinSpec::Bytes(body) = spec.stdin {
        writer.write_all(&body).await.ok();
    }
    writer.shutdown().await.ok();
    Ok(InstanceOutcome::Completed)
}

/// Persistent mode: serve HTTP/2 on the stdio pipes until the transport
/// closes, echoing `echo:<path>:<body>` per stream. Paths containing
/// "slow" are answered after a delay so stream isolation is observable.
async fn serve_tunnel(spec: InstanceSpec) -> Result<InstanceOutcome, EngineError> {
    let (StdinSpec::Reader(reader), StdoutSpec::Writer(writer)) = (spec.stdin, spec.stdout) else {
        return Err(EngineError::instantiation("persistent mode requires piped stdio"));
    };

    let io = tokio::io::join(reader, writer);
    let service = service_fn(|req: hyper::Request<Incoming>| async move {
        let path = req.uri().path().to_string();
        if path.contains("slow") {
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        let body = req
            .into_body()
            .collect()
            .await
            .map(http_body_util::Collected::to_bytes)
            .unwrap_or_default();
        let reply = format!("echo:{path}:{}", String::from_utf8_lossy(&body));
        Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(Bytes::from(reply))))
    });

    // Transport errors here are the normal teardown path.
    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await;

    Ok(InstanceOutcome::Completed)
}
