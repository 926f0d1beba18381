//! Broadcast Dispatcher
//!
//! Turns metrics store changes into one text frame per round and queues it
//! to every registered connection. Delivery is independent per connection:
//! a dead client is dropped from the registry after the round without
//! affecting the others.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::metrics::{MetricsSnapshot, MetricsStore};
use crate::websocket::{frame, ClientRegistry, ConnectionId, Opcode, OutboundFrame};

/// Result of one broadcast round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued to
    pub delivered: usize,
    /// Connections that failed and were unregistered
    pub dropped: Vec<ConnectionId>,
}

/// Pushes metrics snapshots to all registered clients
pub struct BroadcastDispatcher {
    store: Arc<MetricsStore>,
    registry: Arc<ClientRegistry>,
}

impl BroadcastDispatcher {
    pub fn new(store: Arc<MetricsStore>, registry: Arc<ClientRegistry>) -> Self {
        Self { store, registry }
    }

    /// Encode a snapshot as a text frame
    pub fn encode_snapshot(snapshot: &MetricsSnapshot) -> Result<OutboundFrame, DispatchError> {
        let json = snapshot.to_json()?;
        Ok(Arc::from(frame::encode(Opcode::Text, json.as_bytes())))
    }

    /// Frame carrying the current snapshot, for greeting a new client
    pub async fn initial_frame(&self) -> Result<OutboundFrame, DispatchError> {
        let snapshot = self.store.get().await;
        Self::encode_snapshot(&snapshot)
    }

    /// Queue `frame` to every registered client
    ///
    /// Works on a registry snapshot so no lock is held while sending.
    pub async fn broadcast(&self, frame: OutboundFrame) -> BroadcastReport {
        let clients = self.registry.snapshot().await;
        let mut report = BroadcastReport::default();

        for client in &clients {
            // TODO: scope the payload per client once TokenStore::lookup on
            // client.token() is wired in; every client gets the full snapshot.
            match client.send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::debug!(connection_id = %client.id(), error = %e, "Broadcast send failed");
                    report.dropped.push(client.id().to_string());
                }
            }
        }

        for id in &report.dropped {
            self.registry.unregister(id).await;
        }

        if !clients.is_empty() {
            tracing::trace!(
                delivered = report.delivered,
                dropped = report.dropped.len(),
                "Broadcast metrics"
            );
        }
        report
    }

    /// Broadcast the store's current snapshot
    pub async fn broadcast_snapshot(&self) -> Result<BroadcastReport, DispatchError> {
        let frame = self.initial_frame().await?;
        Ok(self.broadcast(frame).await)
    }

    /// Start the dispatch loop
    ///
    /// Waits for store changes and broadcasts the latest snapshot. Several
    /// writes between two rounds produce a single round with the newest values.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        changes.borrow_and_update();

                        if let Err(e) = self.broadcast_snapshot().await {
                            tracing::error!(error = %e, "Failed to broadcast metrics");
                        }
                    }
                }
            }
            tracing::info!("Broadcast dispatcher stopped");
        })
    }
}

/// Errors that can occur while dispatching
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
