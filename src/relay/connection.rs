//! Connection lifecycle
//!
//! Tracks one client connection from accept through upgrade to close, and
//! owns the non-blocking outbound path that broadcast fan-out writes to.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Process-unique identifier assigned to a connection at accept time
pub type ConnectionId = Uuid;

/// Errors that can occur during connection lifecycle operations
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection is not writable in state {0}")]
    NotWritable(ConnectionState),

    #[error("Outbound channel closed")]
    ChannelClosed,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Lifecycle states of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP accepted, upgrade handshake not yet complete
    Accepted,
    /// Handshake complete, eligible for broadcast membership
    Upgraded,
    /// Close initiated, outbound channel released
    Closing,
    /// Terminal state, transport torn down
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Upgraded => "upgraded",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Internal phase; the outbound sender exists only while upgraded, so
/// dropping it on the way out of `Upgraded` happens exactly once
enum Phase {
    Accepted,
    Upgraded { outbound: UnboundedSender<Message> },
    Closing,
    Closed,
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Accepted => ConnectionState::Accepted,
            Phase::Upgraded { .. } => ConnectionState::Upgraded,
            Phase::Closing => ConnectionState::Closing,
            Phase::Closed => ConnectionState::Closed,
        }
    }
}

/// One client connection and its lifecycle state
pub struct Connection {
    /// Unique identifier for this connection
    id: ConnectionId,
    /// Remote socket address
    peer: SocketAddr,
    /// When the connection was accepted
    opened_at: Instant,
    /// Current phase (thread-safe via RwLock)
    phase: RwLock<Phase>,
}

impl Connection {
    /// Create a connection in the `Accepted` state
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            opened_at: Instant::now(),
            phase: RwLock::new(Phase::Accepted),
        }
    }

    /// Get the connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the remote socket address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time elapsed since the connection was accepted
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Get the current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        self.phase.read().await.state()
    }

    /// Mark the handshake complete and attach the outbound channel
    pub async fn upgrade(&self, outbound: UnboundedSender<Message>) -> ConnectionResult<()> {
        let mut phase = self.phase.write().await;
        match *phase {
            Phase::Accepted => {
                *phase = Phase::Upgraded { outbound };
                Ok(())
            }
            ref p => Err(ConnectionError::InvalidTransition {
                from: p.state(),
                to: ConnectionState::Upgraded,
            }),
        }
    }

    /// Queue a frame on the outbound channel without blocking
    ///
    /// Fails unless the connection is `Upgraded`; a closed channel means
    /// the writer task has already gone away.
    pub async fn send(&self, message: Message) -> ConnectionResult<()> {
        let phase = self.phase.read().await;
        match &*phase {
            Phase::Upgraded { outbound } => outbound
                .send(message)
                .map_err(|_| ConnectionError::ChannelClosed),
            p => Err(ConnectionError::NotWritable(p.state())),
        }
    }

    /// Begin closing: drop the outbound sender so the writer task drains
    /// whatever is already queued and then exits
    ///
    /// Idempotent once the connection is `Closing`.
    pub async fn begin_close(&self) -> ConnectionResult<()> {
        let mut phase = self.phase.write().await;
        match *phase {
            Phase::Upgraded { .. } => {
                *phase = Phase::Closing;
                Ok(())
            }
            Phase::Closing => Ok(()),
            ref p => Err(ConnectionError::InvalidTransition {
                from: p.state(),
                to: ConnectionState::Closing,
            }),
        }
    }

    /// Complete the close and enter the terminal state
    ///
    /// Allowed from `Closing` (normal path) and from `Accepted` (handshake
    /// rejected before upgrade). Idempotent once `Closed`; an `Upgraded`
    /// connection must pass through `begin_close` first.
    pub async fn finalize(&self) -> ConnectionResult<()> {
        let mut phase = self.phase.write().await;
        match *phase {
            Phase::Accepted | Phase::Closing => {
                *phase = Phase::Closed;
                Ok(())
            }
            Phase::Closed => Ok(()),
            ref p => Err(ConnectionError::InvalidTransition {
                from: p.state(),
                to: ConnectionState::Closed,
            }),
        }
    }
}
