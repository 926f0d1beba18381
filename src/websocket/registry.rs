//! Client Registry
//!
//! Ordered set of open WebSocket connections eligible for broadcast, bounded
//! by `max_clients`. The registry only holds send handles; the connection
//! handler owns the socket and drains the handle's queue.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// An encoded frame shared between all recipients of a broadcast
pub type OutboundFrame = Arc<[u8]>;

/// Frames queued per connection before it counts as stalled
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Create the queue a connection's writer drains
pub fn outbound_queue() -> (mpsc::Sender<OutboundFrame>, mpsc::Receiver<OutboundFrame>) {
    mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
}

/// Handle for queueing frames to one connection
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    sender: mpsc::Sender<OutboundFrame>,
    token: Option<String>,
}

impl ClientHandle {
    /// Create a handle with a fresh connection ID
    pub fn new(sender: mpsc::Sender<OutboundFrame>, token: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            token,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Security token presented during the handshake
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Queue a frame for the connection's writer
    ///
    /// Never waits. Fails once the writer has stopped, or when the queue is
    /// full because the peer stopped reading.
    pub fn send(&self, frame: OutboundFrame) -> Result<(), RegistryError> {
        self.sender
            .try_send(frame)
            .map_err(|_| RegistryError::SendFailed(self.id.clone()))
    }
}

/// Thread-safe registry of open connections
pub struct ClientRegistry {
    clients: Mutex<Vec<ClientHandle>>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::with_capacity(max_clients)),
            max_clients,
        }
    }

    /// Register a connection
    ///
    /// The size check and the insert happen under the same lock.
    pub async fn register(&self, handle: ClientHandle) -> Result<(), RegistryError> {
        let mut clients = self.clients.lock().await;
        if clients.len() >= self.max_clients {
            return Err(RegistryError::CapacityExceeded {
                max_clients: self.max_clients,
            });
        }

        tracing::info!(
            connection_id = %handle.id(),
            clients = clients.len() + 1,
            "WebSocket client registered"
        );
        clients.push(handle);
        Ok(())
    }

    /// Remove a connection; returns false if it was not registered
    pub async fn unregister(&self, id: &str) -> bool {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|c| c.id() != id);
        let removed = clients.len() != before;

        if removed {
            tracing::info!(
                connection_id = %id,
                clients = clients.len(),
                "WebSocket client unregistered"
            );
        }
        removed
    }

    /// Copy of the current members in registration order
    ///
    /// The lock is released before this returns.
    pub async fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}

/// Errors that can occur in the client registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Too many clients (limit: {max_clients})")]
    CapacityExceeded { max_clients: usize },

    #[error("Failed to send to client {0}")]
    SendFailed(ConnectionId),
}
