//! tcprelay: transparent TCP relay.
//!
//! Accepts plaintext TCP connections and relays each one, byte for byte, to a
//! single fixed downstream address.

mod admission;
mod config;
mod server;
mod tracker;

use clap::Parser;
use config::{CliOverrides, RelayConfig};
use server::RelayServer;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// tcprelay: transparent TCP relay
#[derive(Parser, Debug)]
#[command(name = "tcprelay", version, about = "Transparent TCP relay")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Downstream target (host:port)
    #[arg(short, long)]
    target: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.tcprelay/config.toml")]
    config: String,

    /// Downstream dial timeout in milliseconds
    #[arg(long)]
    dial_timeout_ms: Option<u64>,

    /// Pump poll interval in milliseconds (read/write wait before re-checking cancellation)
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Close sessions idle in both directions for this many seconds (0 = never)
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Transfer buffer size per direction, in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen: self.listen.clone(),
            target: self.target.clone(),
            dial_timeout_ms: self.dial_timeout_ms,
            read_timeout_ms: self.read_timeout_ms,
            idle_timeout_secs: self.idle_timeout_secs,
            buffer_size: self.buffer_size,
            max_sessions: self.max_sessions,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tcprelay");

    let config_path = PathBuf::from(&cli.config);
    let relay_config = match RelayConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let relay = RelayServer::new(relay_config);
    let listener = match relay.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to start listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = relay.serve(listener, shutdown_signal()).await {
        error!(error = %format!("{e:#}"), "server error");
        std::process::exit(1);
    }

    info!("tcprelay stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
