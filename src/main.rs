//! SEWS Server
//!
//! Run with: cargo run -- --port 8080 --source sim:1:100
//!
//! # Configuration
//!
//! Settings come from a TOML file (see `sews config`), then `SEWS_*`
//! environment variables, then the flags below. `RUST_LOG` overrides the
//! configured log level.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sews::config::{generate_default_config, Config, LoggingConfig};
use sews::server::{self, AppState};

#[derive(Parser)]
#[command(name = "sews")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Streams periodically sampled metrics to browser dashboards over WebSocket")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum concurrent WebSocket clients
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Per-connection buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Directory served for plain HTTP requests
    #[arg(long)]
    pub www_root: Option<PathBuf>,

    /// Metrics source: sim:<increment>:<base>, file:<path> or cmd:<command>
    #[arg(short, long)]
    pub source: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.server.max_clients = max_clients;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.server.buffer_size = buffer_size;
        }
        if let Some(www_root) = &self.www_root {
            config.server.www_root = www_root.clone();
        }
        if let Some(source) = &self.source {
            config.metrics.source = source.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Config { output }) = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("Failed to write config to {:?}", path))?;
                println!("Wrote default config to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let (mut config, loaded_from) =
        Config::resolve(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    init_logging(&config.logging);
    match &loaded_from {
        Some(path) => tracing::info!("Loaded config from {:?}", path),
        None => tracing::info!("Using default config with environment overrides"),
    }
    config.validate().context("Invalid configuration")?;
    let source = config.metrics.source()?;

    tracing::info!("Starting SEWS v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        port = config.server.port,
        max_clients = config.server.max_clients,
        buffer_size = config.server.buffer_size,
        www_root = %config.server.www_root.display(),
        source = %source,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server::run(AppState::new(config), source, shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
        }
        // Bind failures end the server task before any signal arrives
        _ = shutdown_tx.closed() => {}
    }

    server
        .await
        .context("Server task failed")?
        .context("Server error")?;

    tracing::info!("SEWS shutdown complete");
    Ok(())
}

/// Install the tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sews={}", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
