//! # Queue Telemetry
//!
//! Logging and metrics for Queue-RPC nodes.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with an env filter, pretty or JSON output
//! - **Metrics**: Prometheus counters for calls, callbacks, poll cycles and errors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use queue_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! let _guard = init_telemetry(config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `QRPC_SERVICE_NAME` | `queue-rpc` | Service name in logs |
//! | `QRPC_NODE_ID` | `00` | Node identifier |
//! | `QRPC_LOG_LEVEL` | `info` | Log level filter |
//! | `QRPC_JSON_LOGS` | `false` | JSON log lines |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging, StructuredLogger};
pub use metrics::{
    register_metrics, HistogramTimer, MetricsHandle, CALLBACKS_RECEIVED,
    CALLS_SENT, CALL_DURATION, DECODE_FAILURES, HANDLER_DURATION, HANDLER_INVOCATIONS,
    PENDING_CALLS, POLL_CYCLES, REMOTE_EXCEPTIONS, TRANSPORT_ERRORS,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The global subscriber could not be installed
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Metric registration or encoding failed
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Configuration could not be turned into a filter
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that should be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Metrics first, they are synchronous and cannot conflict
    let metrics = register_metrics()?;

    let logger = init_logging(&config)?;

    tracing::info!(
        service = %config.full_service_name(),
        json_logs = logger.is_json(),
        "Telemetry initialized"
    );

    Ok(TelemetryGuard { metrics, logger })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    metrics: MetricsHandle,
    logger: StructuredLogger,
}

impl TelemetryGuard {
    /// Metrics registry handle
    pub fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }

    /// Installed logger
    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
