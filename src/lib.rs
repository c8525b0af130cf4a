//! A per-application D-Bus filtering proxy: a sandboxed app connects to a
//! local Unix socket, this crate relays it to the real broker, and applies
//! a rule-based policy (optionally gated behind an interactive consent
//! service) to every message crossing the boundary.

pub mod config;
pub mod consent;
pub mod error;
pub mod filter;
pub mod listener;
pub mod sasl;
pub mod session;
pub mod telemetry;
pub mod wire;

pub use config::{BusKind, ProxyConfig};
pub use error::{Error, Result};
pub use filter::Filter;
