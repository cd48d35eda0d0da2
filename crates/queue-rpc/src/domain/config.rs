//! Node configuration with validation.
//!
//! Queue names and tuning parameters are received verbatim. Defaults follow
//! the queue service the protocol was first deployed on: 30 s long-polls, three
//! concurrent cycles, a 3 s retry delay and statistics every 15 s.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::domain::error::ConfigError;

/// Longest long-poll the queue service accepts
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

/// What to do with a call for a method nobody registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnregisteredMethodPolicy {
    /// Delete the message and send nothing back
    #[default]
    Drop,
    /// Reply with a `method_not_found` remote exception
    ReplyError,
}

impl FromStr for UnregisteredMethodPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "reply-error" | "reply_error" | "error" => Ok(Self::ReplyError),
            other => Err(ConfigError::InvalidValue {
                field: "unregistered_method",
                reason: format!("unknown policy '{}'", other),
            }),
        }
    }
}

/// Complete RPC node configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Queue that calls and callbacks are sent to (the peer's receive queue)
    pub send_queue: String,
    /// Queue this node polls
    pub receive_queue: String,
    /// Maximum concurrently running poll cycles
    pub concurrency: usize,
    /// Poll cycles seeded at start, each re-arms itself forever
    pub pollers: usize,
    /// Delay before re-polling after a failed cycle
    pub retry_delay: Duration,
    /// Long-poll wait per receive, between zero (exclusive) and `MAX_POLL_WAIT`
    pub poll_wait: Duration,
    /// How often scheduler statistics are reported
    pub stats_interval: Duration,
    /// How often scheduler statistics are reset
    pub stats_reset_interval: Duration,
    /// Per-call timeout. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// How often waiters past their deadline are evicted
    pub sweep_interval: Duration,
    /// Policy for calls to unregistered methods
    pub unregistered_method: UnregisteredMethodPolicy,
    /// Observer channel capacity
    pub event_capacity: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            send_queue: "rpc-outbound".to_string(),
            receive_queue: "rpc-inbound".to_string(),
            concurrency: 3,
            pollers: 1,
            retry_delay: Duration::from_secs(3),
            poll_wait: MAX_POLL_WAIT,
            stats_interval: Duration::from_secs(15),
            stats_reset_interval: Duration::from_secs(60 * 60),
            call_timeout: None,
            sweep_interval: Duration::from_secs(30),
            unregistered_method: UnregisteredMethodPolicy::Drop,
            event_capacity: 1024,
        }
    }
}

impl RpcConfig {
    /// Configuration for a node sending to `send_queue` and polling `receive_queue`
    pub fn new(send_queue: impl Into<String>, receive_queue: impl Into<String>) -> Self {
        Self {
            send_queue: send_queue.into(),
            receive_queue: receive_queue.into(),
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName {
                field: "send_queue",
            });
        }
        if self.receive_queue.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName {
                field: "receive_queue",
            });
        }

        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.pollers == 0 || self.pollers > self.concurrency {
            return Err(invalid(
                "pollers",
                format!("must be between 1 and concurrency ({})", self.concurrency),
            ));
        }

        if self.poll_wait.is_zero() {
            return Err(invalid("poll_wait", "cannot be 0"));
        }
        if self.poll_wait > MAX_POLL_WAIT {
            return Err(invalid(
                "poll_wait",
                format!("cannot exceed {}s", MAX_POLL_WAIT.as_secs()),
            ));
        }

        for (field, value) in [
            ("retry_delay", self.retry_delay),
            ("stats_interval", self.stats_interval),
            ("stats_reset_interval", self.stats_reset_interval),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(field, "cannot be 0"));
            }
        }

        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("call_timeout", "cannot be 0"));
        }

        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "cannot be 0"));
        }

        Ok(())
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QRPC_SEND_QUEUE`, `QRPC_RECEIVE_QUEUE`: queue names
    /// - `QRPC_CONCURRENCY`, `QRPC_POLLERS`: scheduler sizing
    /// - `QRPC_RETRY_DELAY_MS`, `QRPC_POLL_WAIT_SECS`: polling cadence
    /// - `QRPC_STATS_INTERVAL_SECS`, `QRPC_STATS_RESET_SECS`: statistics
    /// - `QRPC_CALL_TIMEOUT_MS`, `QRPC_SWEEP_INTERVAL_SECS`: waiter eviction
    /// - `QRPC_UNREGISTERED_METHOD`: `drop` or `reply-error`
    ///
    /// Values that fail to parse keep their default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(queue) = env::var("QRPC_SEND_QUEUE") {
            config.send_queue = queue;
        }
        if let Ok(queue) = env::var("QRPC_RECEIVE_QUEUE") {
            config.receive_queue = queue;
        }
        if let Some(n) = env_parse("QRPC_CONCURRENCY") {
            config.concurrency = n;
        }
        if let Some(n) = env_parse("QRPC_POLLERS") {
            config.pollers = n;
        }
        if let Some(ms) = env_parse("QRPC_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("QRPC_POLL_WAIT_SECS") {
            config.poll_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("QRPC_STATS_INTERVAL_SECS") {
            config.stats_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("QRPC_STATS_RESET_SECS") {
            config.stats_reset_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse("QRPC_CALL_TIMEOUT_MS") {
            config.call_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(secs) = env_parse("QRPC_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = env_parse("QRPC_UNREGISTERED_METHOD") {
            config.unregistered_method = policy;
        }

        config
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_pollers(mut self, pollers: usize) -> Self {
        self.pollers = pollers;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    pub fn with_stats_intervals(mut self, report: Duration, reset: Duration) -> Self {
        self.stats_interval = report;
        self.stats_reset_interval = reset;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_unregistered_method(mut self, policy: UnregisteredMethodPolicy) -> Self {
        self.unregistered_method = policy;
        self
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RpcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(3));
        assert_eq!(config.stats_interval, Duration::from_secs(15));
        assert_eq!(config.stats_reset_interval, Duration::from_secs(3600));
        assert!(config.call_timeout.is_none());
        assert_eq!(config.unregistered_method, UnregisteredMethodPolicy::Drop);
    }

    #[test]
    fn test_empty_queue_name_rejected() {
        let config = RpcConfig::new("", "in");
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyQueueName {
                field: "send_queue"
            })
        );
        let config = RpcConfig::new("out", "  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pollers_bounded_by_concurrency() {
        let config = RpcConfig::default().with_concurrency(2).with_pollers(3);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "pollers",
                ..
            })
        ));
        let config = RpcConfig::default().with_concurrency(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = RpcConfig::default().with_retry_delay(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = RpcConfig::default().with_call_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "call_timeout",
                ..
            })
        ));
    }

    #[test]
    fn test_poll_wait_ceiling() {
        let config = RpcConfig::default().with_poll_wait(Duration::from_secs(31));
        assert!(config.validate().is_err());
        let config = RpcConfig::default().with_poll_wait(Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_wait_rejected() {
        let config = RpcConfig::default().with_poll_wait(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "poll_wait",
                ..
            })
        ));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "drop".parse::<UnregisteredMethodPolicy>(),
            Ok(UnregisteredMethodPolicy::Drop)
        );
        assert_eq!(
            "Reply-Error".parse::<UnregisteredMethodPolicy>(),
            Ok(UnregisteredMethodPolicy::ReplyError)
        );
        assert!("ignore".parse::<UnregisteredMethodPolicy>().is_err());
    }
}
