//! # callrelay
//!
//! Call relay server binary: loads settings, initialises logging and
//! metrics, and runs the signaling server until interrupted.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use callrelay_server::config::ServerConfig;
use callrelay_server::server::RelayServer;
use callrelay_settings::RelaySettings;

/// WebRTC signaling relay.
#[derive(Parser, Debug)]
#[command(name = "callrelay", about = "WebRTC signaling relay server")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings and `PORT`).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.callrelay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Resolve the server config: settings first, then flags.
    fn server_config(&self, settings: &RelaySettings) -> ServerConfig {
        let server = &settings.server;
        ServerConfig {
            host: self.host.clone().unwrap_or_else(|| server.host.clone()),
            port: self.port.unwrap_or(server.port),
            max_connections: server.max_connections,
            send_queue_capacity: server.send_queue_capacity,
            max_message_size: server.max_message_bytes,
            shutdown_timeout_secs: server.shutdown_timeout_secs,
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(callrelay_settings::settings_path);
    let settings = callrelay_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    logging::init_logging(
        settings.logging.level.as_filter_str(),
        args.log_json || settings.logging.json,
    )
    .context("Failed to initialise logging")?;

    let metrics_handle =
        callrelay_server::metrics::install_recorder().context("Failed to install metrics")?;
    let server = RelayServer::new(args.server_config(&settings), metrics_handle);

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;
    tracing::info!("callrelay listening on ws://{addr}/ws");

    shutdown_signal().await?;

    tracing::info!(
        sessions = server.shutdown().session_count(),
        "Shutting down..."
    );
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(server.config().shutdown_timeout()))
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}
