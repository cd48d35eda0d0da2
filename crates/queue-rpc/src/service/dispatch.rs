//! Dispatch of decoded inbound messages.
//!
//! ```text
//!              ┌──────────── callback ────────────┐
//!  message ──► decode                              ├─► registry.resolve ─► delete
//!              │                                   │
//!              ├──────────── call ─────────────────┤
//!              │   registered ─► spawn: handler ─► send callback ─► delete
//!              │   unregistered ─► policy (drop | reply error) ─► delete
//!              │
//!              └── undecodable ─► delete
//! ```
//!
//! A call message is deleted only after its callback was sent, so a crash
//! mid-handler leaves the call on the queue to be redelivered.

use futures::FutureExt;
use queue_telemetry::{metric_inc, metrics, time_histogram};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::domain::{
    decode, encode, Envelope, RemoteException, RequestId, TransportError,
    UnregisteredMethodPolicy,
};
use crate::ports::{QueueMessage, QueueTransport, ReceiptHandle};
use crate::service::events::{EventPublisher, RpcEvent, TransportOperation};
use crate::service::methods::MethodTable;
use crate::service::pending::CorrelationRegistry;

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Callback fired its waiter
    Resolved,
    /// Callback matched no waiter
    Unmatched,
    /// Handler started; its reply is sent in the background
    Invoked,
    /// Call to an unregistered method, deleted without reply
    Dropped,
    /// Call to an unregistered method, answered with `method_not_found`
    Rejected,
    /// Body could not be decoded, deleted
    Discarded,
}

/// Routes inbound envelopes to the registry or to local handlers.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn QueueTransport>,
    registry: Arc<CorrelationRegistry>,
    methods: Arc<MethodTable>,
    events: Arc<EventPublisher>,
    send_queue: Arc<str>,
    receive_queue: Arc<str>,
    policy: UnregisteredMethodPolicy,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        registry: Arc<CorrelationRegistry>,
        methods: Arc<MethodTable>,
        events: Arc<EventPublisher>,
        send_queue: &str,
        receive_queue: &str,
        policy: UnregisteredMethodPolicy,
    ) -> Self {
        Self {
            transport,
            registry,
            methods,
            events,
            send_queue: Arc::from(send_queue),
            receive_queue: Arc::from(receive_queue),
            policy,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handlers currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Handle one received message.
    ///
    /// `Err` means a transport operation needed to finish the message failed;
    /// the message stays on the queue and will be redelivered.
    pub async fn handle_message(
        &self,
        message: QueueMessage,
    ) -> Result<DispatchOutcome, TransportError> {
        let envelope = match decode(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    receipt_handle = %message.receipt_handle,
                    error = %e,
                    "Discarding undecodable message"
                );
                metric_inc!(metrics::DECODE_FAILURES);
                self.events.publish(RpcEvent::DecodeFailed {
                    receipt_handle: message.receipt_handle.clone(),
                    error: e.to_string(),
                });
                self.delete(&message.receipt_handle).await?;
                return Ok(DispatchOutcome::Discarded);
            }
        };

        if envelope.is_call() {
            self.dispatch_call(envelope, message.receipt_handle).await
        } else {
            self.dispatch_callback(envelope, message.receipt_handle)
                .await
        }
    }

    async fn dispatch_callback(
        &self,
        envelope: Envelope,
        receipt: ReceiptHandle,
    ) -> Result<DispatchOutcome, TransportError> {
        metric_inc!(metrics::CALLBACKS_RECEIVED);
        let outcome = envelope.outcome();
        if outcome.is_err() {
            metric_inc!(metrics::REMOTE_EXCEPTIONS);
        }

        let matched = self.registry.resolve(&envelope.request_id, outcome);
        if !matched {
            debug!(
                request_id = %envelope.request_id,
                method = %envelope.method,
                "Callback matched no pending call"
            );
            self.events.publish(RpcEvent::UnknownCallback {
                request_id: envelope.request_id.clone(),
                method: envelope.method.clone(),
            });
        }

        self.delete(&receipt).await?;

        Ok(if matched {
            DispatchOutcome::Resolved
        } else {
            DispatchOutcome::Unmatched
        })
    }

    async fn dispatch_call(
        &self,
        envelope: Envelope,
        receipt: ReceiptHandle,
    ) -> Result<DispatchOutcome, TransportError> {
        let Some(handler) = self.methods.get(&envelope.method) else {
            return self.unregistered(envelope, receipt).await;
        };

        metric_inc!(metrics::HANDLER_INVOCATIONS, &[envelope.method.as_str()]);
        debug!(
            request_id = %envelope.request_id,
            method = %envelope.method,
            "Invoking handler"
        );

        let args = envelope.args();
        let Envelope {
            method, request_id, ..
        } = envelope;

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        tokio::spawn(async move {
            let timer = time_histogram!(metrics::HANDLER_DURATION);
            let outcome = AssertUnwindSafe(handler.call(args)).catch_unwind().await;
            drop(timer);

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(request_id = %request_id, method = %method, "Handler panicked");
                    this.events.publish(RpcEvent::HandlerPanicked {
                        method: method.clone(),
                        request_id: request_id.clone(),
                    });
                    Err(RemoteException::internal(format!(
                        "handler for {} panicked",
                        method
                    )))
                }
            };

            // Failures are already logged and published
            let _ = this.reply(method, request_id, outcome, receipt).await;
            this.in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        Ok(DispatchOutcome::Invoked)
    }

    async fn unregistered(
        &self,
        envelope: Envelope,
        receipt: ReceiptHandle,
    ) -> Result<DispatchOutcome, TransportError> {
        warn!(
            request_id = %envelope.request_id,
            method = %envelope.method,
            policy = ?self.policy,
            "Call to unregistered method"
        );
        self.events.publish(RpcEvent::UnregisteredMethod {
            method: envelope.method.clone(),
            request_id: envelope.request_id.clone(),
        });

        match self.policy {
            UnregisteredMethodPolicy::Drop => {
                self.delete(&receipt).await?;
                Ok(DispatchOutcome::Dropped)
            }
            UnregisteredMethodPolicy::ReplyError => {
                let exception = RemoteException::method_not_found(&envelope.method);
                self.reply(envelope.method, envelope.request_id, Err(exception), receipt)
                    .await?;
                Ok(DispatchOutcome::Rejected)
            }
        }
    }

    /// Send the callback for a call, then delete the call message.
    ///
    /// If the callback cannot be sent the call message is kept.
    async fn reply(
        &self,
        method: String,
        request_id: RequestId,
        outcome: Result<Value, RemoteException>,
        receipt: ReceiptHandle,
    ) -> Result<(), TransportError> {
        let callback = Envelope::callback(method, request_id.clone(), outcome);
        let body = encode(&callback).map_err(|e| {
            error!(request_id = %request_id, error = %e, "Failed to encode callback");
            TransportError::Unavailable(format!("callback not encodable: {}", e))
        })?;

        if let Err(e) = self.transport.send(&self.send_queue, body).await {
            error!(
                request_id = %request_id,
                queue = %self.send_queue,
                error = %e,
                "Failed to send callback, keeping call message"
            );
            self.report(TransportOperation::Send, &e);
            self.events.publish(RpcEvent::ReplyFailed {
                request_id,
                error: e.clone(),
            });
            return Err(e);
        }

        debug!(request_id = %request_id, "Callback sent");
        self.delete(&receipt).await
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        self.transport
            .delete(&self.receive_queue, receipt)
            .await
            .map_err(|e| {
                error!(
                    receipt_handle = %receipt,
                    queue = %self.receive_queue,
                    error = %e,
                    "Failed to delete message"
                );
                self.report(TransportOperation::Delete, &e);
                e
            })
    }

    fn report(&self, operation: TransportOperation, error: &TransportError) {
        metric_inc!(metrics::TRANSPORT_ERRORS, &[operation.as_str()]);
        self.events.publish(RpcEvent::TransportFailed {
            operation,
            error: error.clone(),
        });
    }
}
