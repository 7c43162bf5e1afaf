//! # relay
//!
//! Session relay binary.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use relay_core::logging::init_subscriber;
use relay_server::{IdentityVerifier, RelayServer, StaticTokenVerifier};
use relay_session::SessionHub;
use relay_settings::{LogLevel, load_settings};
use tracing::{info, warn};

/// Multi-tenant real-time session relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Multi-tenant real-time session relay")]
struct Cli {
    /// Settings file (JSON). Missing keys fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,

    /// Development token table: a JSON object mapping tokens to user IDs.
    #[arg(long)]
    tokens: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = cli.log_level {
        match LogLevel::parse(&level) {
            Some(level) => settings.logging.level = level,
            None => bail!("unknown log level: {level}"),
        }
    }
    settings.validate().context("invalid settings")?;

    init_subscriber(settings.logging.level.as_filter_str(), settings.logging.json);
    let metrics = relay_server::metrics::install_recorder()
        .context("failed to install metrics recorder")?;

    let verifier: Arc<dyn IdentityVerifier> = if let Some(path) = &cli.tokens {
        let table = StaticTokenVerifier::from_file(path)
            .with_context(|| format!("failed to load token table {}", path.display()))?;
        info!(tokens = table.len(), "token table loaded");
        Arc::new(table)
    } else {
        warn!("no token table given, every authentication will be rejected");
        Arc::new(StaticTokenVerifier::default())
    };

    let hub = Arc::new(
        SessionHub::with_process_sampler(settings.clone())
            .context("failed to start resource sampler")?,
    );
    let server = RelayServer::new(settings, hub, verifier, Some(metrics));
    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    info!(addr = %addr, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    server
        .shutdown(relay_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT)
        .await;
    let _ = handle.await;
    info!("shutdown complete");
    Ok(())
}
