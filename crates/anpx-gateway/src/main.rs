//! anpx-gateway: public side of the ANPX reverse tunnel.
//!
//! Terminates HTTP from external clients, multiplexes each request over an
//! authenticated WebSocket tunnel to a private receiver, and correlates
//! the framed responses back onto the waiting HTTP connections.

mod auth;
mod config;
mod correlator;
mod directory;
mod error;
mod ingress;
mod registry;
mod router;
mod server;
mod tunnel;

use clap::Parser;
use config::GatewayConfig;
use error::GatewayError;
use server::Gateway;
use std::path::PathBuf;
use tracing::{error, info};

const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_INTERNAL: i32 = 3;

/// anpx-gateway — ANPX reverse-tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "anpx-gateway", version, about = "ANPX reverse-tunnel gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "anpx-gateway.toml")]
    config: PathBuf,

    /// Override the HTTP ingress port
    #[arg(long)]
    http_port: Option<u16>,

    /// Override the tunnel endpoint port
    #[arg(long)]
    ws_port: Option<u16>,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting anpx-gateway");

    let config = match GatewayConfig::load(Some(&cli.config), cli.http_port, cli.ws_port) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "failed to initialize gateway");
            std::process::exit(EXIT_CONFIG);
        }
    };

    match gateway.run().await {
        Ok(()) => info!("anpx-gateway stopped"),
        Err(e @ GatewayError::Bind(_)) => {
            error!(error = %e, "bind failure");
            std::process::exit(EXIT_BIND);
        }
        Err(e) => {
            error!(error = %e, "unrecoverable error");
            std::process::exit(EXIT_INTERNAL);
        }
    }
}
