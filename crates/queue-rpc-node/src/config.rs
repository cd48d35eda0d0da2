//! # Node Configuration
//!
//! Everything the binary needs, read from the environment:
//! the RPC node itself (`QRPC_*`, see `RpcConfig::from_env`), telemetry, and
//! whether to run the loopback demo at startup.

use std::env;

use queue_rpc::{ConfigError, RpcConfig};
use queue_telemetry::TelemetryConfig;

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// RPC node served by this process
    pub rpc: RpcConfig,
    /// Logging and metrics
    pub telemetry: TelemetryConfig,
    /// Start a second node on the swapped queues and call the demo methods
    pub loopback_demo: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            telemetry: TelemetryConfig::default(),
            loopback_demo: true,
        }
    }
}

impl NodeConfig {
    /// Load from environment variables. `QRPC_LOOPBACK_DEMO=false` disables
    /// the demo.
    pub fn from_env() -> Self {
        Self {
            rpc: RpcConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
            loopback_demo: env::var("QRPC_LOOPBACK_DEMO")
                .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(true),
        }
    }

    /// Configuration of the loopback peer: same tuning, queues swapped.
    pub fn loopback_rpc(&self) -> RpcConfig {
        RpcConfig {
            send_queue: self.rpc.receive_queue.clone(),
            receive_queue: self.rpc.send_queue.clone(),
            ..self.rpc.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc.validate()?;
        if self.rpc.send_queue == self.rpc.receive_queue {
            return Err(ConfigError::InvalidValue {
                field: "receive_queue",
                reason: "must differ from send_queue".to_string(),
            });
        }
        Ok(())
    }
}
