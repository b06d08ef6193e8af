//! Engine boundary and lifecycle caches for wcgi-gateway.
//!
//! This crate provides the engine-agnostic core of the gateway:
//! - [`ScriptEngine`] / [`CompiledScript`]: the execution-engine collaborator
//!   boundary ("compile bytes, start an instance with a given environment
//!   and stdio wiring")
//! - [`ModuleKey`] / [`SessionKey`]: cache-busting fingerprints derived from
//!   script identity, modification time, and sandbox configuration
//! - [`ComputeCache`]: a concurrent key→value map with compute-once sharing
//! - [`InstanceRegistry`] / [`InstanceEntry`]: per-script lifecycle records
//!   owning the current module/session binding, an idle timer, and the
//!   cancellation scope that tears everything down
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  InstanceRegistry                       │
//! │  (one entry per script path)                            │
//! │  - idle timer, reset on every request                   │
//! │  - cancellation scope owning module + session           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │             ComputeCache<ModuleKey, ..>                 │
//! │             ComputeCache<SessionKey, ..>                │
//! │  (compute-once: first caller builds, rivals await)      │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            ScriptEngine / CompiledScript                │
//! │  (opaque collaborator: compile, instantiate, run)       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod engine;
pub mod fingerprint;
pub mod lifecycle;

pub use cache::ComputeCache;
pub use engine::{
    CompiledScript, InstanceOutcome, InstanceSpec, ScriptCapability, ScriptEngine, StderrSpec,
    StdinSpec, StdoutSpec, TUNNEL_ENV, TUNNEL_EXPORT,
};
pub use fingerprint::{ModuleKey, SessionKey};
pub use lifecycle::{Binding, InstanceEntry, InstanceRegistry};
