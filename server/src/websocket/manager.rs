//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections and provides broadcast capabilities
//! for pushing persisted changes to connected clients.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Client-chosen identifier; one client may hold several connections
    pub client_id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connections by client_id.
    by_client_id: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, client_id: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        let connection = Connection {
            id: conn_id.clone(),
            client_id: client_id.clone(),
            sender,
        };

        self.connections.insert(conn_id.clone(), connection);
        self.by_client_id
            .entry(client_id)
            .or_default()
            .push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_client_id.get_mut(&conn.client_id) {
                conn_ids.retain(|id| id != conn_id);
                // Clean up empty entries
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_client_id.remove(&conn.client_id);
                }
            }

            tracing::info!(conn_id = %conn_id, client_id = %conn.client_id, "WebSocket connection unregistered");
        }
    }

    /// Broadcast a message to all connections except the sender.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_except(&self, sender_conn_id: &str, message: ServerMessage) -> usize {
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.id != sender_conn_id && conn.sender.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::debug!(
            sender = %sender_conn_id,
            recipients = sent_count,
            "Broadcast message to connections"
        );

        sent_count
    }

    /// Broadcast a message to all connections.
    ///
    /// Used for changes made over HTTP, which have no sending connection.
    pub fn broadcast_all(&self, message: ServerMessage) -> usize {
        self.broadcast_except("", message)
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of distinct clients connected.
    pub fn client_count(&self) -> usize {
        self.by_client_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let conn_id = manager.register("client-1".to_string(), tx);
        let second = manager.register("client-1".to_string(), tx2);
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(manager.client_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.client_count(), 1);
        manager.unregister(&second);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.client_count(), 0);
    }

    #[test]
    fn test_broadcast_except() {
        let manager = ConnectionManager::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let conn1 = manager.register("client-1".to_string(), tx1);
        let _conn2 = manager.register("client-2".to_string(), tx2);

        // Broadcast from conn1 should only reach conn2
        let sent = manager.broadcast_except(&conn1, ServerMessage::Pong);
        assert_eq!(sent, 1);

        // rx1 should not receive (sender excluded)
        assert!(rx1.try_recv().is_err());

        // rx2 should receive
        let msg = rx2.try_recv().unwrap();
        assert!(matches!(msg, ServerMessage::Pong));

        assert_eq!(manager.broadcast_all(ServerMessage::Pong), 2);
    }

    #[test]
    fn test_send_to() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = manager.register("client-1".to_string(), tx);

        assert!(manager.send_to(&conn, ServerMessage::Pong));
        assert!(!manager.send_to("unknown", ServerMessage::Pong));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Pong)));
    }
}
