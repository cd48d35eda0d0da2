//! Observer channel.
//!
//! Everything the inbound loop swallows (decode failures, transport errors,
//! late callbacks) is published here as an `RpcEvent`, together with the
//! scheduler's periodic statistics. Uses `tokio::sync::broadcast`, so any
//! number of observers can subscribe and publishing never blocks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{RequestId, TransportError};
use crate::ports::ReceiptHandle;
use crate::service::scheduler::SchedulerStatsSnapshot;

/// Transport operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOperation {
    Send,
    Receive,
    Delete,
}

impl TransportOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportOperation::Send => "send",
            TransportOperation::Receive => "receive",
            TransportOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for TransportOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the RPC core observed but did not surface to any caller.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// Inbound body was not a valid envelope; the message was deleted
    DecodeFailed {
        receipt_handle: ReceiptHandle,
        error: String,
    },
    /// A transport operation failed
    TransportFailed {
        operation: TransportOperation,
        error: TransportError,
    },
    /// Callback arrived for a request id nobody is waiting on
    UnknownCallback {
        request_id: RequestId,
        method: String,
    },
    /// Call arrived for a method with no local handler
    UnregisteredMethod {
        method: String,
        request_id: RequestId,
    },
    /// A local handler panicked; an internal error was replied
    HandlerPanicked {
        method: String,
        request_id: RequestId,
    },
    /// The reply to a call could not be sent; the call message was kept
    ReplyFailed {
        request_id: RequestId,
        error: TransportError,
    },
    /// Periodic scheduler statistics
    SchedulerStats(SchedulerStatsSnapshot),
    /// Statistics at the moment they were reset
    SchedulerStatsReset(SchedulerStatsSnapshot),
}

/// Publishing side of the observer channel.
pub struct EventPublisher {
    sender: broadcast::Sender<RpcEvent>,
    published: AtomicU64,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Publish an event. Returns the number of observers that received it.
    pub fn publish(&self, event: RpcEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                // No observers
                trace!("Event dropped (no observers)");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
