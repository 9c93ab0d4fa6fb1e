//! WebSocket relay server module
//!
//! Accepts TCP connections, negotiates the upgrade handshake, and drives
//! each connection through the frame dispatch pipeline.

mod handler;
mod handshake;
mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
