//! Connection lifecycle and broadcast membership
//!
//! The shared core every connection task touches: the per-connection state
//! machine and the registry that fan-out delivery runs against.

mod connection;
mod registry;

pub use connection::*;
pub use registry::*;
