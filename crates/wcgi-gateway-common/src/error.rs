//! Error types for the wcgi-gateway.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`GatewayError`]: Top-level errors for request handling
//! - [`CgiError`]: Protocol violations in the CGI response stream
//! - [`EngineError`]: Failures reported by the execution engine

use std::io;

use thiserror::Error;

/// Top-level gateway errors.
///
/// These errors represent failures that can occur while routing one HTTP
/// request through the gateway, from script resolution to response
/// completion.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The requested script does not exist on disk.
    #[error("script not found: {path}")]
    ScriptNotFound {
        /// The path that was requested.
        path: String,
    },

    /// The script path points at a directory, not a file.
    #[error("script path is a directory: {path}")]
    ScriptIsDirectory {
        /// The offending path.
        path: String,
    },

    /// The request carried a chunked body, which CGI cannot frame.
    #[error("chunked request bodies are not supported by CGI")]
    ChunkedBody,

    /// The module violated the CGI response protocol.
    #[error("cgi protocol error: {0}")]
    Cgi(#[from] CgiError),

    /// The execution engine failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The persistent tunnel session failed.
    #[error("tunnel error: {reason}")]
    Tunnel {
        /// Description of the tunnel failure.
        reason: String,
    },

    /// I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Protocol violations in the byte stream a module writes as its CGI
/// response.
///
/// All of these abort the request with a 500 except where the parser
/// explicitly logs and skips (bogus header lines, invalid header names).
#[derive(Error, Debug)]
pub enum CgiError {
    /// A header line exceeded the line-buffer limit.
    #[error("long header line from script")]
    HeaderLineTooLong,

    /// Output ended before any header line, or without a blank-line
    /// terminator.
    #[error("no headers")]
    NoHeaders,

    /// A `Status:` header did not carry a parseable 3-digit code.
    #[error("bogus status: {value:?}")]
    BadStatus {
        /// The unparseable status value.
        value: String,
    },

    /// No status and no `Content-Type` header were produced.
    #[error("missing required Content-Type in headers")]
    MissingContentType,

    /// A `Location` header named an unresolvable local URI.
    #[error("error resolving local URI path {value:?}")]
    BadLocation {
        /// The unresolvable location value.
        value: String,
    },

    /// Reading the module's output failed.
    #[error("error reading headers: {0}")]
    Io(#[from] io::Error),
}

/// Failures reported by the execution engine collaborator.
#[derive(Error, Debug)]
pub enum EngineError {
    /// WebAssembly compilation failed.
    #[error("compilation failed: {reason}")]
    Compilation {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Module instantiation failed before the entry point ran.
    #[error("instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// The module exited with a non-zero status code.
    #[error("module exited with status {code}")]
    Exit {
        /// The exit code.
        code: i32,
    },

    /// I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid engine configuration.
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl GatewayError {
    /// Create a new `ScriptNotFound` error.
    pub fn script_not_found(path: impl Into<String>) -> Self {
        Self::ScriptNotFound { path: path.into() }
    }

    /// Create a new `Tunnel` error.
    pub fn tunnel(reason: impl Into<String>) -> Self {
        Self::Tunnel {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error maps to a client-side (4xx) failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::ScriptNotFound { .. } | Self::ScriptIsDirectory { .. } | Self::ChunkedBody
        )
    }
}

impl EngineError {
    /// Create a new `Compilation` error.
    pub fn compilation(reason: impl Into<String>) -> Self {
        Self::Compilation {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }
}
