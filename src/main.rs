//! HubTunnel agent - expose a local HTTP server through a hub tunnel
//!
//! Configured entirely from `HUBTUNNEL_*` environment variables:
//!
//! ```text
//! HUBTUNNEL_ENDPOINT               Service endpoint (required)
//! HUBTUNNEL_HUB                    Hub name (required)
//! HUBTUNNEL_TOKEN                  Access token
//! HUBTUNNEL_UPSTREAM               Local upstream, default http://localhost:3000
//! HUBTUNNEL_UPSTREAM_INSECURE      Accept any certificate from an https upstream
//! HUBTUNNEL_TARGET                 Target id (optional)
//! HUBTUNNEL_REQUEST_TIMEOUT_SECS   Upstream timeout, default 100
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use hubtunnel_client::{
    HistoryRecorder, InMemoryHistoryStore, StaticTokenProvider, StatusReporter, TracingStatusSink,
    TunnelConfig, TunnelConnection, TunnelService,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const HISTORY_SIZE: usize = 1000;

/// Setup logging; RUST_LOG overrides the default `info` level
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run(config: TunnelConfig, cancel: CancellationToken) -> Result<()> {
    let reporter = StatusReporter::new(Arc::new(TracingStatusSink));
    let history = HistoryRecorder::new(
        Arc::new(InMemoryHistoryStore::new(HISTORY_SIZE)),
        HISTORY_SIZE,
    );

    let service_options = config.service_options().map_err(|e| anyhow!(e))?;
    let service = TunnelService::new(service_options, reporter.clone(), history)
        .context("Failed to create tunnel service")?;

    let tunnel = TunnelConnection::new(
        config.connection_options().map_err(|e| anyhow!(e))?,
        Arc::new(StaticTokenProvider::new(config.access_token.clone())),
        reporter,
        Arc::new(service),
    )
    .context("Failed to create tunnel connection")?;

    tunnel.run(cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    info!(
        "HubTunnel {} ({}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let config = TunnelConfig::from_env()
        .map_err(|e| anyhow!(e))
        .context("Invalid HUBTUNNEL_* configuration")?;
    info!("Endpoint: {}", config.endpoint);
    info!("Hub: {}", config.hub);
    info!("Upstream: {}", config.upstream);
    if let Some(ref target) = config.target {
        info!("Target: {}", target);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                cancel.cancel();
            }
        });
    }

    match run(config, cancel).await {
        Ok(()) => {
            info!("HubTunnel stopped");
            Ok(())
        }
        Err(e) => {
            error!("Tunnel error: {:#}", e);
            Err(e)
        }
    }
}
