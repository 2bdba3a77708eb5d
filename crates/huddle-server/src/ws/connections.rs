use async_trait::async_trait;
use huddle_protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Unicast delivery of server messages, keyed by connection
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage);
}

pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from connection ID to the authenticated user
    connection_users: RwLock<HashMap<Uuid, Uuid>>,
    /// Map from user ID to connection IDs (a user may have multiple connections)
    user_connections: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            connection_users: RwLock::new(HashMap::new()),
            user_connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.senders.write().await.insert(connection_id, sender);
        self.connection_users
            .write()
            .await
            .insert(connection_id, user_id);
        self.user_connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(connection_id);

        tracing::debug!(
            "User {} connected with connection ID {}",
            user_id,
            connection_id
        );
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        let user_id = self.connection_users.write().await.remove(&connection_id);

        if let Some(user_id) = user_id {
            let mut user_connections = self.user_connections.write().await;
            if let Some(conns) = user_connections.get_mut(&user_id) {
                conns.remove(&connection_id);
                if conns.is_empty() {
                    user_connections.remove(&user_id);
                }
            }

            tracing::debug!(
                "User {} disconnected (connection ID {})",
                user_id,
                connection_id
            );
        }

        self.senders.write().await.remove(&connection_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }

    pub async fn is_user_online(&self, user_id: Uuid) -> bool {
        self.user_connections
            .read()
            .await
            .get(&user_id)
            .is_some_and(|conns| !conns.is_empty())
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ConnectionManager {
    async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        match senders.get(&connection_id) {
            Some(sender) => {
                if let Err(e) = sender.send(json) {
                    tracing::debug!("Failed to send message to {}: {}", connection_id, e);
                }
            }
            None => tracing::debug!("Dropping message for closed connection {}", connection_id),
        }
    }
}
