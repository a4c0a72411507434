//! Session manager for tracking all connected peers

use super::connection::{PeerRole, SessionHandle};
use crate::deploy::PeerDirectory;
use async_trait::async_trait;
use bytes::Bytes;
use fleet_shared::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Manages all active peer sessions
pub struct SessionManager {
    /// Map of peer_id -> session handle
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session, replacing any earlier one with the same peer id
    ///
    /// Returns the replaced handle.
    pub async fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        if handle.peer_id.is_empty() {
            return None;
        }

        let mut sessions = self.sessions.write().await;
        let replaced = sessions.insert(handle.peer_id.clone(), handle);
        if let Some(old) = &replaced {
            info!("Peer {} reconnected from {}", old.peer_id, old.addr);
        }
        replaced
    }

    /// Unregister a session if it is still the current one for its peer id
    pub async fn unregister(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&handle.peer_id) {
            Some(current) if current.same_connection(handle) => {
                sessions.remove(&handle.peer_id);
                true
            }
            _ => false,
        }
    }

    /// Get a session handle for a specific peer
    pub async fn get(&self, peer_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(peer_id).cloned()
    }

    /// Send a message to a specific peer
    pub async fn send_to(&self, peer_id: &str, message: &Message) -> anyhow::Result<()> {
        let handle = self
            .get(peer_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("Peer not connected: {}", peer_id))?;
        handle.send(message).await
    }

    /// Broadcast a message to all connected controllers
    pub async fn broadcast_controllers(&self, message: &Message) {
        for handle in self.with_role(PeerRole::Controller).await {
            if let Err(e) = handle.send(message).await {
                warn!("Failed to send to {}: {}", handle.peer_id, e);
            }
        }
    }

    /// Get list of all connected device IDs, sorted
    pub async fn connected_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .with_role(PeerRole::Device)
            .await
            .into_iter()
            .map(|handle| handle.peer_id)
            .collect();
        devices.sort();
        devices
    }

    /// Get the number of connected peers
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // Snapshot so sends never happen under the lock
    async fn with_role(&self, role: PeerRole) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|handle| handle.role == role)
            .cloned()
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDirectory for SessionManager {
    async fn send_frame(&self, peer_id: &str, payload: Bytes) -> anyhow::Result<()> {
        let handle = self
            .get(peer_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("Peer not connected: {}", peer_id))?;
        handle.send_payload(&payload).await
    }

    async fn notify_controllers(&self, message: Message) {
        self.broadcast_controllers(&message).await;
    }
}
