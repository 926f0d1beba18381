//! Metrics Collection
//!
//! - **store**: bounded name → value map with change notification
//! - **source**: simulated, file and pipe samplers
//! - **collector**: periodic task driving a source into the store

mod collector;
mod error;
mod source;
mod store;
mod types;

pub use collector::{CollectorStats, MetricCollector, DEFAULT_INTERVAL};
pub use error::{CollectionError, MetricsError, MetricsResult};
pub use source::{
    parse_metric_line, parse_metrics_file, parse_pipe_output, CollectorSource, FileSource,
    MetricSource, PipeSource, SimulatedSource,
};
pub use store::{MetricsStore, SetReport, DEFAULT_CAPACITY};
pub use types::{MetricSample, MetricsSnapshot};
