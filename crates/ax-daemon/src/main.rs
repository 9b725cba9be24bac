//! ax-daemon: hosts the execution orchestrator until ctrl-c.

use anyhow::{Context, Result};
use ax_core::config::Config;
use ax_daemon::daemon::Daemon;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::var_os("AX_CONFIG") {
        Some(path) => Config::load_from(path).context("failed to load config from AX_CONFIG")?,
        None => Config::load().context("failed to load config")?,
    };

    ax_telemetry::logging::init_from_config(&config.general);
    info!(
        service = %config.general.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "daemon starting"
    );

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.cancel();
    });

    daemon.run().await
}
