//! Metrics error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the metrics store and source descriptors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    /// A new metric name would exceed the store's capacity
    #[error("Metrics capacity of {capacity} exceeded by '{name}'")]
    CapacityExceeded { capacity: usize, name: String },

    /// Metric names must be non-empty
    #[error("Metric name must not be empty")]
    EmptyName,

    /// Source descriptor is not `sim:`, `file:` or `cmd:`
    #[error("Invalid metrics source '{0}': expected sim:<increment>:<base>, file:<path> or cmd:<command>")]
    InvalidSource(String),
}

/// A collection tick that produced no samples
///
/// Logged by the collector; the next tick runs as scheduled.
#[derive(Error, Debug)]
pub enum CollectionError {
    /// Metrics file missing or unreadable
    #[error("Failed to read metrics file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Command could not be started
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exited unsuccessfully
    #[error("Command '{command}' failed with {status}")]
    CommandFailed { command: String, status: String },

    /// Output did not contain the expected values
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result type alias for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;
