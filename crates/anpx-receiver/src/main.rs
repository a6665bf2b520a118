//! anpx-receiver: private side of the ANPX reverse tunnel.
//!
//! Holds an authenticated WebSocket open to the gateway, reassembles
//! incoming request frames, serves them through a local application, and
//! frames the responses back.

mod app;
mod auth;
mod client;
mod config;
mod dispatcher;
mod error;

use clap::Parser;
use client::ReceiverClient;
use config::ReceiverConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_CONFIG: i32 = 1;

/// anpx-receiver — ANPX tunnel receiver
#[derive(Parser, Debug)]
#[command(name = "anpx-receiver", version, about = "ANPX tunnel receiver")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "anpx-receiver.toml")]
    config: PathBuf,

    /// Gateway tunnel URL (ws:// or wss://)
    #[arg(long)]
    gateway_url: Option<String>,

    /// DID to authenticate as
    #[arg(long)]
    did: Option<String>,

    /// Path to the hex-encoded ed25519 signing seed
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting anpx-receiver");

    let config = match ReceiverConfig::load(
        Some(&cli.config),
        cli.gateway_url.as_deref(),
        cli.did.as_deref(),
        cli.key_file.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let client = match ReceiverClient::new(config, Arc::new(app::DemoApp)) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to initialize receiver");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tokio::select! {
        _ = client.run() => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("anpx-receiver stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
