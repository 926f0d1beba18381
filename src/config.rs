//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides; command
//! line flags are applied on top by the binary.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::metrics::CollectorSource;

/// Smallest accepted connection buffer
pub const MIN_BUFFER_SIZE: usize = 128;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub tokens: TokensConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_www_root")]
    pub www_root: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_clients() -> usize {
    10
}

fn default_buffer_size() -> usize {
    4096
}

fn default_www_root() -> PathBuf {
    PathBuf::from("./www")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            buffer_size: default_buffer_size(),
            www_root: default_www_root(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Metric collection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_source() -> String {
    "sim:1:100".to_string()
}

fn default_interval() -> u64 {
    1000 // 1 second
}

fn default_capacity() -> usize {
    20
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            interval_ms: default_interval(),
            capacity: default_capacity(),
        }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Parse the source descriptor
    pub fn source(&self) -> Result<CollectorSource, ConfigError> {
        self.source
            .parse::<CollectorSource>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Security token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_token_length")]
    pub length: usize,
}

fn default_ttl() -> u64 {
    3600 // 1 hour
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_token_length() -> usize {
    32
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            length: default_token_length(),
        }
    }
}

impl TokensConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file to load: the explicit path, else the first default
    /// location that exists
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let config_paths = [
            dirs::config_dir().map(|p| p.join("sews").join("config.toml")),
            Some(PathBuf::from("/etc/sews/config.toml")),
            Some(PathBuf::from("./sews.toml")),
        ];
        config_paths.into_iter().flatten().find(|path| path.exists())
    }

    /// Load from an explicit path, the default locations, or environment
    ///
    /// Also returns the file that was loaded, if any, so the caller can
    /// report it once logging is up. A config file that exists but cannot
    /// be read or parsed is an error.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match Self::locate(explicit) {
            Some(path) => {
                let config = Self::load_with_env(&path)?;
                Ok((config, Some(path)))
            }
            None => Ok((Self::from_env(), None)),
        }
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a `SEWS_*` variable lookup
    ///
    /// Numeric values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server overrides
        if let Some(host) = lookup("SEWS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("SEWS_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(max) = lookup("SEWS_MAX_CLIENTS").and_then(|m| m.parse().ok()) {
            self.server.max_clients = max;
        }
        if let Some(size) = lookup("SEWS_BUFFER_SIZE").and_then(|s| s.parse().ok()) {
            self.server.buffer_size = size;
        }
        if let Some(root) = lookup("SEWS_WWW_ROOT") {
            self.server.www_root = PathBuf::from(root);
        }

        // Metrics overrides
        if let Some(source) = lookup("SEWS_METRICS_SOURCE") {
            self.metrics.source = source;
        }

        // Logging overrides
        if let Some(level) = lookup("SEWS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("SEWS_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_clients == 0 {
            return Err(ConfigError::Invalid(
                "server.max_clients must be at least 1".to_string(),
            ));
        }
        if self.server.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "server.buffer_size must be at least {} bytes",
                MIN_BUFFER_SIZE
            )));
        }
        if self.metrics.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "metrics.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.metrics.capacity == 0 {
            return Err(ConfigError::Invalid(
                "metrics.capacity must be at least 1".to_string(),
            ));
        }
        if self.tokens.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "tokens.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        self.metrics.source()?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# SEWS Configuration
#
# Environment variables override these settings:
# - SEWS_HOST
# - SEWS_PORT
# - SEWS_MAX_CLIENTS
# - SEWS_BUFFER_SIZE
# - SEWS_WWW_ROOT
# - SEWS_METRICS_SOURCE
# - SEWS_LOG_LEVEL
# - SEWS_LOG_FORMAT

[server]
# Listen address
host = "0.0.0.0"
port = 8080

# Maximum number of concurrent WebSocket clients
max_clients = 10

# Per-connection read buffer; also the largest accepted frame (bytes)
buffer_size = 4096

# Directory served for plain HTTP requests
www_root = "./www"

[metrics]
# Source: sim:<increment>:<base>, file:<path> or cmd:<shell command>
source = "sim:1:100"

# Sampling interval (ms)
interval_ms = 1000

# Maximum number of distinct metrics
capacity = 20

[tokens]
# Lifetime of tokens issued with dashboard pages (seconds)
ttl_secs = 3600

# How often expired tokens are removed (seconds)
sweep_interval_secs = 60

# Token length in characters
length = 32

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
