//! Metric Collector
//!
//! Periodically samples a [`MetricSource`] into the [`MetricsStore`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::error::CollectionError;
use super::source::MetricSource;
use super::store::{MetricsStore, SetReport};

/// Default interval between ticks
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Counters describing the collector's history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub ticks: u64,
    pub failures: u64,
}

/// Background sampler feeding the metrics store
pub struct MetricCollector {
    store: Arc<MetricsStore>,
    interval: Duration,
    ticks: AtomicU64,
    failures: AtomicU64,
}

impl MetricCollector {
    pub fn new(store: Arc<MetricsStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            ticks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Run one tick: sample the source and write the results
    pub async fn tick(&self, source: &mut dyn MetricSource) -> Result<SetReport, CollectionError> {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let samples = match source.sample().await {
            Ok(samples) => samples,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let report = self.store.set_many(samples).await;
        tracing::trace!(
            source = source.name(),
            applied = report.applied,
            rejected = report.rejected.len(),
            "Collector tick"
        );
        Ok(report)
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Start the collection loop
    ///
    /// The shutdown signal is checked before every tick; once it is observed
    /// no further tick starts. Await the returned handle to join the loop.
    pub fn start(
        self: Arc<Self>,
        mut source: Box<dyn MetricSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                source = source.name(),
                interval_ms = self.interval.as_millis() as u64,
                "Metric collector started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }

                if *shutdown.borrow() {
                    break;
                }

                if let Err(e) = self.tick(source.as_mut()).await {
                    tracing::warn!(source = source.name(), error = %e, "Metric collection tick failed");
                }
            }

            let stats = self.stats();
            tracing::info!(
                ticks = stats.ticks,
                failures = stats.failures,
                "Metric collector stopped"
            );
        })
    }
}
