//! Metric Sources
//!
//! A source produces one batch of samples per collector tick:
//! - `sim:<increment>:<base>` - synthetic counters, never fails
//! - `file:<path>` - `name=value[unit]` lines, re-read every tick
//! - `cmd:<command>` - shell command printing two integers

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::{CollectionError, MetricsError};
use super::types::MetricSample;

/// Counter wraps at this value
const COUNTER_MODULUS: i64 = 1000;

/// Largest offset a simulated metric adds to `base`
const MAX_SIMULATED_OFFSET: i64 = 200 + 69;

/// Names published by a pipe source, in output order
const PIPE_METRICS: [&str; 2] = ["value1", "value2"];

/// Common trait for all metric sources
#[async_trait]
pub trait MetricSource: Send {
    /// Short name for logging
    fn name(&self) -> &str;

    /// Produce this tick's samples
    async fn sample(&mut self) -> Result<Vec<MetricSample>, CollectionError>;
}

/// Parsed metrics source descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorSource {
    Simulated { increment: i64, base: i64 },
    File { path: PathBuf },
    Pipe { command: String },
}

impl CollectorSource {
    /// Build the source implementation for a collection session
    pub fn into_source(self) -> Box<dyn MetricSource> {
        match self {
            CollectorSource::Simulated { increment, base } => {
                Box::new(SimulatedSource::new(increment, base))
            }
            CollectorSource::File { path } => Box::new(FileSource::new(path)),
            CollectorSource::Pipe { command } => Box::new(PipeSource::new(command)),
        }
    }
}

impl FromStr for CollectorSource {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MetricsError::InvalidSource(s.to_string());
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;

        match kind {
            "sim" => {
                let (increment, base) = rest.split_once(':').ok_or_else(invalid)?;
                let increment: i64 = increment.trim().parse().map_err(|_| invalid())?;
                let base: i64 = base.trim().parse().map_err(|_| invalid())?;
                if base.checked_add(MAX_SIMULATED_OFFSET).is_none() {
                    return Err(invalid());
                }
                Ok(CollectorSource::Simulated { increment, base })
            }
            "file" if !rest.trim().is_empty() => Ok(CollectorSource::File {
                path: PathBuf::from(rest.trim()),
            }),
            "cmd" if !rest.trim().is_empty() => Ok(CollectorSource::Pipe {
                command: rest.trim().to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for CollectorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorSource::Simulated { increment, base } => {
                write!(f, "sim:{}:{}", increment, base)
            }
            CollectorSource::File { path } => write!(f, "file:{}", path.display()),
            CollectorSource::Pipe { command } => write!(f, "cmd:{}", command),
        }
    }
}

/// Synthetic source driven by a wrapping counter
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    counter: i64,
    increment: i64,
    base: i64,
}

impl SimulatedSource {
    /// The increment is reduced modulo the counter range, so any value is safe
    pub fn new(increment: i64, base: i64) -> Self {
        Self {
            counter: 0,
            increment: increment.rem_euclid(COUNTER_MODULUS),
            base,
        }
    }

    /// Current counter value
    pub fn counter(&self) -> i64 {
        self.counter
    }

    /// Advance the counter and derive this tick's values
    pub fn advance(&mut self) -> Vec<MetricSample> {
        self.counter = (self.counter + self.increment).rem_euclid(COUNTER_MODULUS);
        let c = self.counter;
        let offset = |extra: i64| self.base.saturating_add(extra);

        vec![
            MetricSample::new("cpu", c),
            MetricSample::new("memory", offset(c % 50)),
            MetricSample::new("disk", offset(100 + c % 30)),
            MetricSample::new("network", offset(200 + c % 70)),
        ]
    }
}

#[async_trait]
impl MetricSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn sample(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        Ok(self.advance())
    }
}

/// Reads `name=value[unit]` lines from a file every tick
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn sample(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CollectionError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(parse_metrics_file(&content))
    }
}

/// Parse every well-formed line of a metrics file
///
/// Blank lines and `#` comments are ignored; malformed lines are skipped
/// without affecting the others.
pub fn parse_metrics_file(content: &str) -> Vec<MetricSample> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let parsed = parse_metric_line(trimmed);
            if parsed.is_none() {
                tracing::debug!(line = idx + 1, content = %trimmed, "Skipping malformed metric line");
            }
            parsed
        })
        .collect()
}

/// Parse one `name=value[unit]` line
pub fn parse_metric_line(line: &str) -> Option<MetricSample> {
    let (name, rest) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let (value, unit) = match rest.split_once('[') {
        Some((value, unit_part)) => {
            let unit = unit_part.split_once(']').map(|(unit, _)| unit.trim());
            (value, unit)
        }
        None => (rest, None),
    };

    let value: i64 = value.trim().parse().ok()?;
    let sample = MetricSample::new(name, value);
    Some(match unit {
        Some(unit) => sample.unit(unit),
        None => sample,
    })
}

/// Runs a shell command every tick and reads two integers from its output
#[derive(Debug, Clone)]
pub struct PipeSource {
    command: String,
}

impl PipeSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl MetricSource for PipeSource {
    fn name(&self) -> &str {
        "pipe"
    }

    async fn sample(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CollectionError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CollectionError::CommandFailed {
                command: self.command.clone(),
                status: output.status.to_string(),
            });
        }

        parse_pipe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the leading whitespace-separated integers of a command's output
pub fn parse_pipe_output(output: &str) -> Result<Vec<MetricSample>, CollectionError> {
    let mut tokens = output.split_whitespace();

    PIPE_METRICS
        .iter()
        .map(|name| {
            let token = tokens.next().ok_or_else(|| {
                CollectionError::Parse(format!(
                    "expected {} integers, got {:?}",
                    PIPE_METRICS.len(),
                    output.trim()
                ))
            })?;
            let value = token
                .parse()
                .map_err(|_| CollectionError::Parse(format!("not an integer: {:?}", token)))?;
            Ok(MetricSample::new(*name, value))
        })
        .collect()
}
