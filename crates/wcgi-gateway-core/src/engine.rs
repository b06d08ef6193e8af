//! The execution-engine collaborator boundary.
//!
//! The gateway treats WebAssembly compilation and execution as an opaque
//! capability behind two traits: [`ScriptEngine`] ("compile bytes into a
//! module") and [`CompiledScript`] ("start an instance with a given
//! environment and stdio wiring, and wait for its outcome"). Everything the
//! rest of the workspace does — caching, CGI bridging, tunneling — is
//! written against these traits, which also makes every protocol path
//! testable with an in-memory engine double.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use wcgi_gateway_common::EngineError;

/// Export a module must carry to be eligible for the persistent protocol.
pub const TUNNEL_EXPORT: &str = "wagi_wcgi";

/// Environment flag telling a module it was launched in persistent mode.
pub const TUNNEL_ENV: &str = "WAGI_WCGI";

/// Execution mode a compiled module supports.
///
/// Determined once at compile time from the module's exports and cached
/// alongside the compiled artifact; never re-probed per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCapability {
    /// The module only supports one-shot CGI execution.
    ClassicOnly,
    /// The module exports the persistent-protocol entry point and can serve
    /// many requests over a tunnel session.
    PersistentTunnel,
}

/// Standard input wiring for a module instance.
pub enum StdinSpec {
    /// No input; reads see end-of-file immediately.
    Null,
    /// A fixed buffer, typically a collected request body.
    Bytes(Bytes),
    /// A live byte stream, typically the guest half of a tunnel pipe.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

/// Standard output wiring for a module instance.
pub enum StdoutSpec {
    /// Output is dropped.
    Discard,
    /// Output is streamed into the given writer while the module runs.
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

/// Standard error wiring for a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrSpec {
    /// The module's error stream is dropped.
    Discard,
    /// The module's error stream is surfaced on the host's stderr.
    Inherit,
}

/// Everything an engine needs to instantiate and run one module instance.
pub struct InstanceSpec {
    /// Program arguments; by convention `args[0]` is the script path.
    pub args: Vec<String>,
    /// Environment variables visible to the instance.
    pub env: Vec<(String, String)>,
    /// Standard input wiring.
    pub stdin: StdinSpec,
    /// Standard output wiring.
    pub stdout: StdoutSpec,
    /// Standard error wiring.
    pub stderr: StderrSpec,
    /// Directory mounted into the instance's filesystem view, at the same
    /// guest path, and used as its working directory.
    pub workdir: Option<PathBuf>,
    /// Network policy rule string gating the instance's virtual network
    /// device; `None` leaves the instance with no network at all.
    pub net_rule: Option<String>,
}

impl InstanceSpec {
    /// Create a spec with no input, discarded output, and no mounts.
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            env: Vec::new(),
            stdin: StdinSpec::Null,
            stdout: StdoutSpec::Discard,
            stderr: StderrSpec::Discard,
            workdir: None,
            net_rule: None,
        }
    }
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InstanceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceSpec")
            .field("args", &self.args)
            .field("env_count", &self.env.len())
            .field(
                "stdin",
                &match self.stdin {
                    StdinSpec::Null => "null",
                    StdinSpec::Bytes(_) => "bytes",
                    StdinSpec::Reader(_) => "reader",
                },
            )
            .field(
                "stdout",
                &match self.stdout {
                    StdoutSpec::Discard => "discard",
                    StdoutSpec::Writer(_) => "writer",
                },
            )
            .field("stderr", &self.stderr)
            .field("workdir", &self.workdir)
            .field("net_rule", &self.net_rule)
            .finish()
    }
}

/// How a module instance finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// The instance ran to completion (exit status zero).
    Completed,
    /// The instance exited with a non-zero status.
    Exited(i32),
    /// The instance trapped.
    Trapped {
        /// Description of the trap.
        message: String,
    },
}

impl InstanceOutcome {
    /// Returns `true` if the instance completed normally.
    pub fn is_success(&self) -> bool {
        matches!(self, InstanceOutcome::Completed)
    }
}

/// A compiled WebAssembly module, ready to be instantiated.
#[async_trait]
pub trait CompiledScript: Send + Sync {
    /// Which execution modes this module supports.
    fn capability(&self) -> ScriptCapability;

    /// Instantiate the module and run it to completion.
    ///
    /// The future resolves when the instance finishes; dropping it asks the
    /// engine to stop the instance and release its resources.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation fails before the entry point runs.
    async fn start(&self, spec: InstanceSpec) -> Result<InstanceOutcome, EngineError>;
}

/// The execution-engine collaborator.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Compile raw WebAssembly bytes into a module.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid module.
    async fn compile(&self, bytes: Vec<u8>) -> Result<Arc<dyn CompiledScript>, EngineError>;
}
