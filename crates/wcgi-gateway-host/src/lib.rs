//! Network policy engine and wasmtime execution backend for wcgi-gateway.
//!
//! This crate provides the host-side capabilities sandboxed modules are
//! granted:
//!
//! - [`matcher`] / [`rule`]: the allow/deny rule model evaluated against
//!   candidate network addresses
//! - [`device`]: the virtual network device — openable paths under `/dev`
//!   that dial real TCP/UDP/TLS connections, subject to policy
//! - [`runtime`]: the production [`WasmtimeEngine`] implementing the
//!   engine collaborator boundary from `wcgi-gateway-core`
//!
//! # Security Model
//!
//! A module never receives raw socket privileges. Outbound connectivity
//! exists only through the policy-gated device, and a rejected or malformed
//! address is indistinguishable from a missing file — the sandbox learns
//! nothing about the policy's structure from a refusal.

pub mod device;
pub mod matcher;
pub mod rule;
pub mod runtime;

pub use device::{DeviceAddr, NetDevice, NetFamily, NetStream};
pub use matcher::{HostAddr, Matcher};
pub use rule::NetPolicy;
pub use runtime::WasmtimeEngine;
