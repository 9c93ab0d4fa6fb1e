//! Broadcast membership registry
//!
//! The single piece of state shared across all connection tasks: the set of
//! upgraded connections eligible for fan-out, keyed by connection id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionId};
use crate::server::RelayMessage;

/// Concurrency-safe set of live upgraded connections
pub struct BroadcastRegistry {
    /// Members keyed by connection id (thread-safe via RwLock)
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    /// Member count, readable without taking the lock
    active: AtomicUsize,
}

impl BroadcastRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Number of currently registered connections
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Register an upgraded connection
    ///
    /// Re-adding the same id overwrites the entry and never duplicates
    /// delivery.
    pub async fn add(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        if connections.insert(connection.id(), connection).is_none() {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Remove a connection; no-op if it was never registered
    pub async fn remove(&self, id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.remove(&id).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Fan a message out to every registered connection, sender included
    ///
    /// The member list is snapshotted under the read lock and the lock is
    /// released before any send, so a slow or failing recipient never blocks
    /// membership changes. Recipients whose outbound path has gone away are
    /// pruned afterwards.
    pub async fn broadcast(&self, message: RelayMessage) {
        let line = message.render();

        let recipients: Vec<Arc<Connection>> = {
            let connections = self.connections.read().await;
            connections.values().cloned().collect()
        };

        debug!(
            "Broadcasting message from {} to {} connection(s)",
            message.sender,
            recipients.len()
        );

        let mut stale = Vec::new();
        for connection in &recipients {
            if let Err(e) = connection.send(Message::Text(line.clone())).await {
                warn!(
                    "Dropping connection {} ({}) from broadcast: {}",
                    connection.id(),
                    connection.peer(),
                    e
                );
                stale.push(connection.id());
            }
        }

        for id in stale {
            self.remove(id).await;
        }
    }
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}
