//! One inbound poll cycle: receive at most one message and dispatch it.

use async_trait::async_trait;
use queue_telemetry::{metric_inc, metrics};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::domain::TransportError;
use crate::ports::QueueTransport;
use crate::service::dispatch::{DispatchOutcome, Dispatcher};
use crate::service::events::{EventPublisher, RpcEvent, TransportOperation};
use crate::service::scheduler::CycleJob;

/// Result of a successful cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A message was received and dispatched
    Dispatched(DispatchOutcome),
    /// The long-poll returned nothing
    Empty,
}

/// Polls the receive queue on behalf of the scheduler.
pub struct InboundLoop {
    transport: Arc<dyn QueueTransport>,
    dispatcher: Dispatcher,
    events: Arc<EventPublisher>,
    receive_queue: String,
    poll_wait: Duration,
}

impl InboundLoop {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        dispatcher: Dispatcher,
        events: Arc<EventPublisher>,
        receive_queue: impl Into<String>,
        poll_wait: Duration,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            events,
            receive_queue: receive_queue.into(),
            poll_wait,
        }
    }

    /// Run one cycle.
    ///
    /// The transport's "no message" signal is an empty cycle, not a failure.
    /// Any other transport error fails the cycle so the scheduler backs off.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, TransportError> {
        let received = self
            .transport
            .receive(&self.receive_queue, self.poll_wait)
            .await;

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!(queue = %self.receive_queue, "No message");
                metric_inc!(metrics::POLL_CYCLES, &["empty"]);
                return Ok(CycleOutcome::Empty);
            }
            Err(e) if e.is_empty_queue() => {
                trace!(queue = %self.receive_queue, "No message");
                metric_inc!(metrics::POLL_CYCLES, &["empty"]);
                return Ok(CycleOutcome::Empty);
            }
            Err(e) => {
                warn!(queue = %self.receive_queue, error = %e, "Receive failed");
                metric_inc!(metrics::TRANSPORT_ERRORS, &[TransportOperation::Receive.as_str()]);
                metric_inc!(metrics::POLL_CYCLES, &["failed"]);
                self.events.publish(RpcEvent::TransportFailed {
                    operation: TransportOperation::Receive,
                    error: e.clone(),
                });
                return Err(e);
            }
        };

        debug!(
            queue = %self.receive_queue,
            receipt_handle = %message.receipt_handle,
            "Received message"
        );

        match self.dispatcher.handle_message(message).await {
            Ok(outcome) => {
                metric_inc!(metrics::POLL_CYCLES, &["dispatched"]);
                Ok(CycleOutcome::Dispatched(outcome))
            }
            Err(e) => {
                metric_inc!(metrics::POLL_CYCLES, &["failed"]);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CycleJob for InboundLoop {
    type Error = TransportError;

    async fn run(&self) -> Result<(), TransportError> {
        self.run_cycle().await.map(|_| ())
    }
}
