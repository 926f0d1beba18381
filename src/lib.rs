//! # SEWS
//!
//! Simple Embedded WebSocket Server - samples named integer metrics on a
//! fixed interval and pushes them as JSON to every connected browser session.
//!
//! ## Features
//!
//! - **Hand-rolled WebSocket**: RFC 6455 handshake and unfragmented framing
//! - **Bounded client registry**: at most `max_clients` concurrent sessions
//! - **Pluggable sources**: simulated counters, a metrics file, or a shell command
//! - **Static dashboard**: plain HTTP requests are served from `www_root`
//!
//! ## Modules
//!
//! - [`websocket`]: Frame codec, handshake and client registry
//! - [`metrics`]: Metrics store, sources and periodic collector
//! - [`dispatch`]: Broadcasts store snapshots to all clients
//! - [`server`]: Accept loop and per-connection handler
//! - [`http`]: Static file serving
//! - [`tokens`]: Security tokens issued with dashboard pages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sews::{Config, AppState};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let source = config.metrics.source()?;
//!     let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     let server = tokio::spawn(sews::server::run(AppState::new(config), source, shutdown_rx));
//!
//!     tokio::signal::ctrl_c().await?;
//!     shutdown_tx.send(true)?;
//!     server.await??;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod http;
pub mod metrics;
pub mod server;
pub mod tokens;
pub mod websocket;

// Re-export top-level types for convenience
pub use config::{generate_default_config, Config, ConfigError, LoggingConfig};

pub use dispatch::{BroadcastDispatcher, BroadcastReport, DispatchError};

pub use metrics::{
    CollectionError, CollectorSource, MetricCollector, MetricSample, MetricSource, MetricsError,
    MetricsSnapshot, MetricsStore,
};

pub use server::{AppState, ConnectionError, Server, ServerError, ServerResult};

pub use tokens::{SecurityToken, TokenError, TokenStore};

pub use websocket::{ClientHandle, ClientRegistry, Frame, Opcode, ProtocolError, RegistryError};
