//! Core metric types
//!
//! - `MetricSample`: one named integer value with an optional unit
//! - `MetricsSnapshot`: immutable, insertion-ordered copy of the store

use serde::ser::{Serialize, SerializeMap, Serializer};

/// A single named measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    /// Unique metric name, e.g. `cpu`
    pub name: String,
    /// Current value
    pub value: i64,
    /// Unit of measure (`%`, `MB`, `KB/s`, ...)
    pub unit: Option<String>,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
            unit: None,
        }
    }

    /// Builder method: set the unit
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        let unit = unit.into();
        self.unit = if unit.is_empty() { None } else { Some(unit) };
        self
    }
}

/// Point-in-time copy of all metrics, in insertion order
///
/// Serializes as the broadcast payload: a flat object of name to integer
/// value. Units are not part of the wire shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    samples: Vec<MetricSample>,
}

impl MetricsSnapshot {
    pub(crate) fn new(samples: Vec<MetricSample>) -> Self {
        Self { samples }
    }

    /// Look up a metric by name
    pub fn get(&self, name: &str) -> Option<&MetricSample> {
        self.samples.iter().find(|s| s.name == name)
    }

    /// Value of a metric, if present
    pub fn value(&self, name: &str) -> Option<i64> {
        self.get(name).map(|s| s.value)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter()
    }

    /// Render the broadcast payload, e.g. `{"cpu":42,"memory":123}`
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for MetricsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.samples.len()))?;
        for sample in &self.samples {
            map.serialize_entry(&sample.name, &sample.value)?;
        }
        map.end()
    }
}
