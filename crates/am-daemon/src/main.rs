//! agentmux daemon: hosts persistent agent terminals behind an
//! HTTP/WebSocket API.

use anyhow::{Context, Result};
use am_core::config::Config;
use am_daemon::daemon::Daemon;
use am_telemetry::logging::{self, LogFormat};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load ~/.agentmux/config.toml")?;

    logging::init(
        "agentmux",
        &config.general.log_level,
        LogFormat::from_config(&config.general.log_format),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "agentmux daemon starting"
    );

    let daemon = Daemon::new(config);
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
