//! termgate-server: web terminal session gateway.
//!
//! Opens backend sessions on behalf of browser clients, parks them under
//! one-time tokens, and bridges each to the WebSocket that claims it.

mod backend;
mod config;
mod protocol;
mod server;
mod transport;

use clap::Parser;
use config::{BackendKind, CliOverrides, ServerConfig};
use server::TermgateServer;
use std::path::PathBuf;
use tracing::{error, info};

/// termgate-server: web terminal session gateway
#[derive(Parser, Debug)]
#[command(name = "termgate-server", version, about = "Web terminal session gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.termgate/config.toml")]
    config: String,

    /// Seconds an unclaimed session is kept before it is closed
    #[arg(long)]
    recycle_delay: Option<u64>,

    /// Backend connector
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Attribute clients by X-Real-Ip / X-Real-Port (behind a reverse proxy)
    #[arg(long)]
    trust_proxy_headers: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termgate-server");

    let overrides = CliOverrides {
        listen: cli.listen.clone(),
        port: cli.port,
        recycle_delay: cli.recycle_delay,
        backend: cli.backend,
        trust_proxy_headers: cli.trust_proxy_headers,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let connector = match backend::build_connector(&server_config.backend) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to set up backend");
            std::process::exit(1);
        }
    };

    let server = TermgateServer::new(server_config, connector);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
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
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
