//! Outbound Ports (Driven Ports)
//!
//! The queue transport the core depends on. Network retries, authentication
//! and queue provisioning live behind this trait.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::domain::TransportError;

/// Opaque token acknowledging one received message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message retrieved by polling.
///
/// Must be deleted exactly once, after the core has finished acting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Message body
    pub body: String,
    /// Handle to pass to `delete`
    pub receipt_handle: ReceiptHandle,
}

/// Message queue transport.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue a message body.
    async fn send(&self, queue: &str, body: String) -> Result<(), TransportError>;

    /// Long-poll for at most one message.
    ///
    /// Returns `Ok(None)` when no message arrived within `wait`. Transports
    /// whose service reports an empty queue as an error may return that error
    /// instead, as long as `TransportError::is_empty_queue` recognises it.
    async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<QueueMessage>, TransportError>;

    /// Acknowledge consumption of a received message.
    async fn delete(&self, queue: &str, receipt: &ReceiptHandle) -> Result<(), TransportError>;
}
