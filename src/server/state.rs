//! Server State
//!
//! Shared objects handed to every connection task.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::BroadcastDispatcher;
use crate::metrics::MetricsStore;
use crate::tokens::TokenStore;
use crate::websocket::ClientRegistry;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration
    pub config: Arc<Config>,
    /// Current metric values
    pub store: Arc<MetricsStore>,
    /// Open WebSocket connections
    pub registry: Arc<ClientRegistry>,
    /// Snapshot broadcaster
    pub dispatcher: Arc<BroadcastDispatcher>,
    /// Tokens issued with dashboard pages
    pub tokens: Arc<TokenStore>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MetricsStore::new(config.metrics.capacity));
        let registry = Arc::new(ClientRegistry::new(config.server.max_clients));
        let dispatcher = Arc::new(BroadcastDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
        ));
        let tokens = Arc::new(TokenStore::new(config.tokens.ttl(), config.tokens.length));

        Self {
            config: Arc::new(config),
            store,
            registry,
            dispatcher,
            tokens,
        }
    }
}
