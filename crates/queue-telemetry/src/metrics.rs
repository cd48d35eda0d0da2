//! Prometheus metrics for Queue-RPC nodes.
//!
//! All metrics follow the naming convention: `qrpc_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., calls_sent_total)
//! - **Gauge**: Value that can go up or down (e.g., pending_calls)
//! - **Histogram**: Distribution of values (e.g., call_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // CALLER SIDE
    // =========================================================================

    /// Call envelopes sent to the outbound queue
    pub static ref CALLS_SENT: Counter = Counter::new(
        "qrpc_calls_sent_total",
        "Total number of call envelopes sent"
    ).expect("metric creation failed");

    /// Callback envelopes received, matched or not
    pub static ref CALLBACKS_RECEIVED: Counter = Counter::new(
        "qrpc_callbacks_received_total",
        "Total number of callback envelopes received"
    ).expect("metric creation failed");

    /// Callbacks that carried a remote exception
    pub static ref REMOTE_EXCEPTIONS: Counter = Counter::new(
        "qrpc_remote_exceptions_total",
        "Total number of callbacks resolved with a remote exception"
    ).expect("metric creation failed");

    /// Calls currently awaiting a callback
    pub static ref PENDING_CALLS: Gauge = Gauge::new(
        "qrpc_pending_calls",
        "Number of calls awaiting a callback"
    ).expect("metric creation failed");

    /// Round trip time from send to callback
    pub static ref CALL_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "qrpc_call_duration_seconds",
            "Time between sending a call and receiving its callback"
        ).buckets(exponential_buckets(0.001, 2.0, 16).unwrap())
    ).expect("metric creation failed");

    // =========================================================================
    // INBOUND SIDE
    // =========================================================================

    /// Poll cycles by outcome (dispatched, empty, discarded, failed)
    pub static ref POLL_CYCLES: CounterVec = CounterVec::new(
        Opts::new("qrpc_poll_cycles_total", "Inbound poll cycles by outcome"),
        &["outcome"]
    ).expect("metric creation failed");

    /// Inbound messages that could not be decoded
    pub static ref DECODE_FAILURES: Counter = Counter::new(
        "qrpc_decode_failures_total",
        "Total number of inbound messages discarded as undecodable"
    ).expect("metric creation failed");

    /// Transport errors by operation (send, receive, delete)
    pub static ref TRANSPORT_ERRORS: CounterVec = CounterVec::new(
        Opts::new("qrpc_transport_errors_total", "Transport errors by operation"),
        &["operation"]
    ).expect("metric creation failed");

    /// Local handler invocations by method
    pub static ref HANDLER_INVOCATIONS: CounterVec = CounterVec::new(
        Opts::new("qrpc_handler_invocations_total", "Local handler invocations by method"),
        &["method"]
    ).expect("metric creation failed");

    /// Time spent inside local handlers
    pub static ref HANDLER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "qrpc_handler_duration_seconds",
            "Time spent executing local method handlers"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).unwrap())
    ).expect("metric creation failed");
}

/// Handle to the registry the metrics were registered with
#[derive(Clone)]
pub struct MetricsHandle {
    registry: Arc<Registry>,
}

impl MetricsHandle {
    /// Render all registered metrics in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String, TelemetryError> {
        encode_registry(&self.registry)
    }
}

/// Register all metrics with the global registry.
///
/// Calling this more than once is harmless.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Caller side
        Box::new(CALLS_SENT.clone()),
        Box::new(CALLBACKS_RECEIVED.clone()),
        Box::new(REMOTE_EXCEPTIONS.clone()),
        Box::new(PENDING_CALLS.clone()),
        Box::new(CALL_DURATION.clone()),
        // Inbound side
        Box::new(POLL_CYCLES.clone()),
        Box::new(DECODE_FAILURES.clone()),
        Box::new(TRANSPORT_ERRORS.clone()),
        Box::new(HANDLER_INVOCATIONS.clone()),
        Box::new(HANDLER_DURATION.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        registry: Arc::new(REGISTRY.clone()),
    })
}

fn encode_registry(registry: &Registry) -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_is_idempotent() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_counter_increment() {
        CALLS_SENT.inc();
        assert!(CALLS_SENT.get() >= 1.0);
    }

    #[test]
    fn test_labelled_counter() {
        POLL_CYCLES.with_label_values(&["empty"]).inc();
        assert!(POLL_CYCLES.with_label_values(&["empty"]).get() >= 1.0);
    }

    #[test]
    fn test_gather_text_contains_metric_names() {
        let handle = register_metrics().unwrap();
        DECODE_FAILURES.inc();
        let text = handle.gather_text().unwrap();
        assert!(text.contains("qrpc_decode_failures_total"));
    }

    #[test]
    fn test_histogram_timer() {
        let before = CALL_DURATION.get_sample_count();
        {
            let _timer = HistogramTimer::new(&CALL_DURATION);
        }
        assert!(CALL_DURATION.get_sample_count() > before);
    }
}
