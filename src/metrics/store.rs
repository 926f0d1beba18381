//! Metrics Store
//!
//! Thread-safe mapping from metric name to value and unit, bounded by a
//! fixed capacity. Every successful write bumps a version published on a
//! `watch` channel; subscribers always observe the latest version, so a burst
//! of writes coalesces into one notification without losing the final value.

use tokio::sync::{watch, RwLock};

use super::error::{MetricsError, MetricsResult};
use super::types::{MetricSample, MetricsSnapshot};

/// Default number of distinct metrics
pub const DEFAULT_CAPACITY: usize = 20;

/// Outcome of applying one tick's samples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetReport {
    /// Samples inserted or updated
    pub applied: usize,
    /// Names rejected because the store was full
    pub rejected: Vec<String>,
}

/// Shared store of current metric values
pub struct MetricsStore {
    metrics: RwLock<Vec<MetricSample>>,
    capacity: usize,
    version: watch::Sender<u64>,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            metrics: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
            version,
        }
    }

    /// Insert or update a metric
    ///
    /// An update without a unit keeps the unit already stored.
    pub async fn set(&self, name: &str, value: i64, unit: Option<&str>) -> MetricsResult<()> {
        {
            let mut metrics = self.metrics.write().await;
            Self::upsert(&mut metrics, self.capacity, name, value, unit)?;
        }
        self.notify();
        Ok(())
    }

    /// Apply a batch of samples under one lock and one notification
    pub async fn set_many(&self, samples: Vec<MetricSample>) -> SetReport {
        let mut report = SetReport::default();
        {
            let mut metrics = self.metrics.write().await;
            for sample in samples {
                match Self::upsert(
                    &mut metrics,
                    self.capacity,
                    &sample.name,
                    sample.value,
                    sample.unit.as_deref(),
                ) {
                    Ok(()) => report.applied += 1,
                    Err(e) => {
                        tracing::warn!(metric = %sample.name, error = %e, "Metric rejected");
                        report.rejected.push(sample.name);
                    }
                }
            }
        }

        if report.applied > 0 {
            self.notify();
        }
        report
    }

    /// Consistent copy of all metrics
    pub async fn get(&self) -> MetricsSnapshot {
        MetricsSnapshot::new(self.metrics.read().await.clone())
    }

    /// Receiver notified after every successful write
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Number of successful writes so far
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub async fn len(&self) -> usize {
        self.metrics.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.metrics.read().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn upsert(
        metrics: &mut Vec<MetricSample>,
        capacity: usize,
        name: &str,
        value: i64,
        unit: Option<&str>,
    ) -> MetricsResult<()> {
        if name.is_empty() {
            return Err(MetricsError::EmptyName);
        }
        let unit = unit.filter(|u| !u.is_empty());

        if let Some(existing) = metrics.iter_mut().find(|m| m.name == name) {
            existing.value = value;
            if let Some(unit) = unit {
                existing.unit = Some(unit.to_string());
            }
            return Ok(());
        }

        if metrics.len() >= capacity {
            return Err(MetricsError::CapacityExceeded {
                capacity,
                name: name.to_string(),
            });
        }

        metrics.push(MetricSample {
            name: name.to_string(),
            value,
            unit: unit.map(str::to_string),
        });
        Ok(())
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
