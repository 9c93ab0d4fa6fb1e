//! Relay protocol constants and message rendering
//!
//! Wire-level constants shared by the handshake and dispatch layers, plus
//! the message type every broadcast line is built from.

use chrono::{DateTime, Local};

use crate::relay::ConnectionId;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8888;

/// The only resource path accepted for the upgrade handshake
pub const WEBSOCKET_PATH: &str = "/webSocket";

/// WebSocket protocol version this server negotiates
pub const WEBSOCKET_VERSION: &str = "13";

/// Maximum inbound message size in bytes (64 KiB)
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Separator between the routing prefix and the original payload
pub const PAYLOAD_SEPARATOR: &str = "===>>>";

/// Timestamp format for the relayed line prefix
const TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// A text message received from one connection, ready for fan-out
#[derive(Debug, Clone)]
pub struct RelayMessage {
    /// Connection the message arrived on
    pub sender: ConnectionId,
    /// Original message body, unmodified
    pub body: String,
    /// When the server received the message
    pub received_at: DateTime<Local>,
}

impl RelayMessage {
    /// Create a message stamped with the current local time
    pub fn new(sender: ConnectionId, body: impl Into<String>) -> Self {
        Self {
            sender,
            body: body.into(),
            received_at: Local::now(),
        }
    }

    /// Render the line delivered to every recipient
    ///
    /// Receive time and sender id are prefixed for display; the original
    /// body stays verbatim as the suffix.
    pub fn render(&self) -> String {
        format!(
            "{} {} {} {}",
            self.received_at.format(TIMESTAMP_FORMAT),
            self.sender,
            PAYLOAD_SEPARATOR,
            self.body
        )
    }
}
