//! Wasmtime-backed implementation of the execution-engine boundary.
//!
//! This module provides [`WasmtimeEngine`], the production
//! [`ScriptEngine`]: it compiles WebAssembly bytes (consulting an optional
//! on-disk artifact cache keyed by content hash), detects whether a module
//! exports the persistent-protocol entry point, and instantiates modules
//! under WASI preview 1 with the stdio wiring, environment, mounts, and
//! network policy from an [`InstanceSpec`].
//!
//! The artifact cache is purely a speed optimization for recompilation
//! across process restarts; every cache failure is logged and falls back to
//! a fresh compile.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use wasmtime::{Config, Engine, Linker, Module, OptLevel, Store};
use wasmtime_wasi::pipe::{AsyncReadStream, AsyncWriteStream, MemoryInputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{AsyncStdinStream, AsyncStdoutStream, DirPerms, FilePerms, WasiCtxBuilder};

use wcgi_gateway_common::{EngineConfig, EngineError};
use wcgi_gateway_core::engine::{
    CompiledScript, InstanceOutcome, InstanceSpec, ScriptCapability, ScriptEngine, StderrSpec,
    StdinSpec, StdoutSpec, TUNNEL_EXPORT,
};

use crate::rule::NetPolicy;

/// Buffered bytes allowed between the instance's stdout and the host
/// reader before guest writes back-pressure.
const STDOUT_BUDGET: usize = 64 * 1024;

/// The production execution engine, backed by Wasmtime.
///
/// The engine is thread-safe and shared across all requests; each started
/// instance gets its own [`Store`] for isolation.
pub struct WasmtimeEngine {
    engine: Engine,
    artifact_dir: Option<PathBuf>,
}

impl WasmtimeEngine {
    /// Create a new engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is rejected.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut wasmtime_config = Config::new();

        // Async support so host I/O (pipes, sockets) never blocks a worker
        // thread while an instance runs.
        wasmtime_config.async_support(true);
        wasmtime_config.cranelift_opt_level(OptLevel::Speed);

        let engine = Engine::new(&wasmtime_config).map_err(|e| EngineError::InvalidConfig {
            reason: format!("failed to create wasmtime engine: {e}"),
        })?;

        let artifact_dir = if config.cache_compiled_modules {
            config.cache_dir.as_ref().map(PathBuf::from)
        } else {
            None
        };
        if let Some(dir) = &artifact_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "artifact cache unavailable");
            }
        }

        info!("wasmtime engine initialized");

        Ok(Self {
            engine,
            artifact_dir,
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    fn artifact_path(&self, content_hash: &str) -> Option<PathBuf> {
        self.artifact_dir
            .as_ref()
            .map(|dir| dir.join(format!("{content_hash}.cwasm")))
    }

    /// Load a pre-compiled artifact if one exists for this hash.
    #[allow(unsafe_code)]
    fn load_artifact(&self, content_hash: &str) -> Option<Module> {
        let path = self.artifact_path(content_hash)?;
        if !path.exists() {
            return None;
        }
        let start = Instant::now();
        // SAFETY: we only load artifacts our own serialize step produced,
        // keyed by the hash of the source bytes.
        match unsafe { Module::deserialize_file(&self.engine, &path) } {
            Ok(module) => {
                debug!(
                    path = %path.display(),
                    duration_us = start.elapsed().as_micros(),
                    "precompiled module loaded"
                );
                Some(module)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "stale artifact ignored");
                None
            }
        }
    }

    /// Persist a compiled artifact. Failures are logged, never fatal.
    fn store_artifact(&self, content_hash: &str, module: &Module) {
        let Some(path) = self.artifact_path(content_hash) else {
            return;
        };
        match module.serialize() {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(path = %path.display(), error = %e, "failed to write artifact");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize module"),
        }
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), EngineError> {
        if bytes.len() < 8 {
            return Err(EngineError::compilation("invalid wasm: file too small"));
        }
        if &bytes[0..4] != b"\0asm" {
            return Err(EngineError::compilation("invalid wasm: bad magic number"));
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptEngine for WasmtimeEngine {
    #[instrument(skip(self, bytes), fields(bytes_len = bytes.len()))]
    async fn compile(&self, bytes: Vec<u8>) -> Result<Arc<dyn CompiledScript>, EngineError> {
        Self::validate_wasm_header(&bytes)?;

        let content_hash = compute_hash(&bytes);
        let start = Instant::now();

        let module = match self.load_artifact(&content_hash) {
            Some(module) => module,
            None => {
                let engine = self.engine.clone();
                let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
                    .await
                    .map_err(|e| EngineError::compilation(format!("compile task failed: {e}")))?
                    .map_err(|e| EngineError::compilation(e.to_string()))?;
                self.store_artifact(&content_hash, &module);
                module
            }
        };

        let capability = if module.get_export(TUNNEL_EXPORT).is_some() {
            ScriptCapability::PersistentTunnel
        } else {
            ScriptCapability::ClassicOnly
        };

        info!(
            content_hash = %content_hash,
            capability = ?capability,
            duration_ms = start.elapsed().as_millis(),
            "module compiled"
        );

        Ok(Arc::new(WasmtimeScript {
            engine: self.engine.clone(),
            module,
            capability,
            content_hash,
        }))
    }
}

impl std::fmt::Debug for WasmtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeEngine")
            .field("artifact_dir", &self.artifact_dir)
            .finish_non_exhaustive()
    }
}

/// A compiled module plus the engine it belongs to.
struct WasmtimeScript {
    engine: Engine,
    module: Module,
    capability: ScriptCapability,
    content_hash: String,
}

impl WasmtimeScript {
    fn build_wasi(&self, spec: InstanceSpec) -> Result<WasiP1Ctx, EngineError> {
        let mut builder = WasiCtxBuilder::new();

        builder.args(&spec.args);
        for (key, value) in &spec.env {
            builder.env(key, value);
        }

        match spec.stdin {
            StdinSpec::Null => {}
            StdinSpec::Bytes(bytes) => {
                builder.stdin(MemoryInputPipe::new(bytes));
            }
            StdinSpec::Reader(reader) => {
                builder.stdin(AsyncStdinStream::new(AsyncReadStream::new(reader)));
            }
        }
        match spec.stdout {
            StdoutSpec::Discard => {}
            StdoutSpec::Writer(writer) => {
                builder.stdout(AsyncStdoutStream::new(AsyncWriteStream::new(
                    STDOUT_BUDGET,
                    writer,
                )));
            }
        }
        if spec.stderr == StderrSpec::Inherit {
            builder.inherit_stderr();
        }

        if let Some(dir) = &spec.workdir {
            let guest_path = dir.to_string_lossy();
            builder
                .preopened_dir(dir, guest_path.as_ref(), DirPerms::all(), FilePerms::all())
                .map_err(|e| {
                    EngineError::instantiation(format!(
                        "failed to mount {}: {e}",
                        dir.display()
                    ))
                })?;
        }

        // The engine-level integration point for the network policy: guest
        // socket operations are checked against the same rules that gate
        // the virtual device paths.
        if let Some(rule) = &spec.net_rule {
            let policy = Arc::new(NetPolicy::parse(rule));
            builder.allow_ip_name_lookup(true);
            builder.socket_addr_check(move |addr, _use| {
                let policy = policy.clone();
                Box::pin(async move { policy.allows_addr(&addr) })
                    as Pin<Box<dyn Future<Output = bool> + Send + Sync>>
            });
        }

        Ok(builder.build_p1())
    }
}

#[async_trait]
impl CompiledScript for WasmtimeScript {
    fn capability(&self) -> ScriptCapability {
        self.capability
    }

    #[instrument(skip(self, spec), fields(content_hash = %self.content_hash))]
    async fn start(&self, spec: InstanceSpec) -> Result<InstanceOutcome, EngineError> {
        let wasi = self.build_wasi(spec)?;
        let mut store = Store::new(&self.engine, wasi);

        let mut linker = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |ctx: &mut WasiP1Ctx| ctx)
            .map_err(|e| EngineError::instantiation(e.to_string()))?;

        let instance = linker
            .instantiate_async(&mut store, &self.module)
            .await
            .map_err(|e| EngineError::instantiation(e.to_string()))?;

        let entry = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|_| EngineError::instantiation("entry point '_start' not found"))?;

        match entry.call_async(&mut store, ()).await {
            Ok(()) => Ok(InstanceOutcome::Completed),
            Err(error) => {
                if let Some(exit) = error.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    if exit.0 == 0 {
                        Ok(InstanceOutcome::Completed)
                    } else {
                        Ok(InstanceOutcome::Exited(exit.0))
                    }
                } else {
                    Ok(InstanceOutcome::Trapped {
                        message: error.to_string(),
                    })
                }
            }
        }
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmtimeEngine {
        WasmtimeEngine::new(&EngineConfig {
            cache_compiled_modules: false,
            cache_dir: None,
        })
        .unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(WasmtimeEngine::validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(WasmtimeEngine::validate_wasm_header(&[0x00, 0x61]).is_err());
        assert!(
            WasmtimeEngine::validate_wasm_header(&[0x00, 0x00, 0x00, 0x00, 1, 0, 0, 0]).is_err()
        );
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16); // 64-bit hex
    }

    // (module (func (export "_start"))) encoded by hand: type, function,
    // export, and code sections around an empty body.
    const START_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type ()->()
        0x03, 0x02, 0x01, 0x00, // one function of type 0
        0x07, 0x0a, 0x01, 0x06, 0x5f, 0x73, 0x74, 0x61, 0x72, 0x74, 0x00,
        0x00, // export "_start"
        0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b, // empty body
    ];

    #[tokio::test]
    async fn test_compile_classic_module() {
        let engine = engine();
        let script = engine.compile(MINIMAL_WASM.to_vec()).await.unwrap();
        assert_eq!(script.capability(), ScriptCapability::ClassicOnly);
    }

    #[tokio::test]
    async fn test_tunnel_export_detection() {
        let engine = engine();

        let module = wasmtime::Module::new(
            engine.inner(),
            r#"(module (func (export "_start")) (func (export "wagi_wcgi")))"#,
        )
        .unwrap();
        assert!(module.get_export(TUNNEL_EXPORT).is_some());

        let module =
            wasmtime::Module::new(engine.inner(), r#"(module (func (export "_start")))"#).unwrap();
        assert!(module.get_export(TUNNEL_EXPORT).is_none());
    }

    #[tokio::test]
    async fn test_compile_rejects_garbage() {
        let engine = engine();
        let result = engine.compile(b"not wasm at all".to_vec()).await;
        assert!(matches!(result, Err(EngineError::Compilation { .. })));
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let engine = engine();
        let script = engine.compile(START_WASM.to_vec()).await.unwrap();

        let outcome = script.start(InstanceSpec::new()).await.unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_start_without_entry_point_fails() {
        let engine = engine();
        let script = engine.compile(MINIMAL_WASM.to_vec()).await.unwrap();

        let result = script.start(InstanceSpec::new()).await;
        assert!(matches!(result, Err(EngineError::Instantiation { .. })));
    }
}
