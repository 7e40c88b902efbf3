//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections and pushes confirmed harmonics to the
//! clients subscribed to their collection.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use harmony_engine::Harmonic;
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Token of the authenticated user
    pub user: String,
    /// Collections to push; every collection when empty
    pub collections: BTreeSet<String>,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

impl Connection {
    fn wants(&self, collection: &str) -> bool {
        self.collections.is_empty() || self.collections.contains(collection)
    }
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, user: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        let connection = Connection {
            id: conn_id.clone(),
            user,
            collections: BTreeSet::new(),
            sender,
        };
        self.connections.insert(conn_id.clone(), connection);

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            tracing::info!(conn_id = %conn_id, user = %conn.user, "WebSocket connection unregistered");
        }
    }

    /// Replace the subscription of a connection.
    pub fn subscribe(&self, conn_id: &str, collections: Vec<String>) -> bool {
        match self.connections.get_mut(conn_id) {
            Some(mut conn) => {
                conn.collections = collections.into_iter().collect();
                true
            }
            None => false,
        }
    }

    /// Push a harmonic to every connection subscribed to its collection.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_harmonic(&self, harmonic: &Harmonic) -> usize {
        let message = ServerMessage::Harmonic {
            harmonic: harmonic.clone(),
        };
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.wants(&harmonic.table_name) && conn.sender.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::debug!(
            harmonic_id = %harmonic.id,
            collection = %harmonic.table_name,
            recipients = sent_count,
            "Pushed harmonic to connections"
        );

        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        if let Some(conn) = self.connections.get(conn_id) {
            conn.sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
