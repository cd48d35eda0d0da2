//! # Queue-RPC Node
//!
//! Serves the demo methods over the configured queues until Ctrl+C.

use anyhow::{Context, Result};
use queue_rpc_node::{NodeConfig, NodeRuntime};
use queue_telemetry::init_telemetry;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env();
    let telemetry =
        init_telemetry(config.telemetry.clone()).context("failed to initialise telemetry")?;

    let mut runtime = NodeRuntime::new(&config)?;
    runtime.start()?;

    if config.loopback_demo {
        if let Err(e) = runtime.run_demo().await {
            error!(error = %e, "Loopback demo failed");
        }
    }

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    runtime.shutdown().await;

    match telemetry.metrics().gather_text() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => error!(error = %e, "Failed to render metrics"),
    }
    Ok(())
}
