//! Outbound calls.
//!
//! A call registers its waiter before the envelope is sent, so a callback
//! can never arrive ahead of its registration. If the send fails the waiter
//! is removed again and the caller gets `CallError::Send`.

use queue_telemetry::{metric_inc, metrics};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::{encode, CallError, Envelope, RequestId};
use crate::ports::QueueTransport;
use crate::service::pending::{CorrelationRegistry, Reply};

/// Sends calls to the peer and waits for their callbacks.
#[derive(Clone)]
pub struct Caller {
    transport: Arc<dyn QueueTransport>,
    registry: Arc<CorrelationRegistry>,
    send_queue: Arc<str>,
    call_timeout: Option<Duration>,
}

impl Caller {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        registry: Arc<CorrelationRegistry>,
        send_queue: &str,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            registry,
            send_queue: Arc::from(send_queue),
            call_timeout,
        }
    }

    /// Call `method` on the peer and wait for its result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.call_with_request_id(method, params, RequestId::generate())
            .await
    }

    /// Call with a caller-chosen request id.
    ///
    /// Fails with `DuplicateRequestId` if that id is already waiting.
    pub async fn call_with_request_id(
        &self,
        method: &str,
        params: Vec<Value>,
        request_id: RequestId,
    ) -> Result<Value, CallError> {
        self.send_call(method, params, request_id)
            .await?
            .wait()
            .await
    }

    /// Call and deserialize the result
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, CallError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(CallError::Decode)
    }

    /// Call without awaiting. `callback` runs exactly once with the outcome.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn call_with<F>(&self, method: impl Into<String>, params: Vec<Value>, callback: F) -> RequestId
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        let request_id = RequestId::generate();
        let caller = self.clone();
        let method = method.into();
        let id = request_id.clone();

        tokio::spawn(async move {
            let result = caller.call_with_request_id(&method, params, id).await;
            callback(result);
        });

        request_id
    }

    /// Register the waiter and send the call envelope.
    pub async fn send_call(
        &self,
        method: &str,
        params: Vec<Value>,
        request_id: RequestId,
    ) -> Result<PendingCall, CallError> {
        let envelope = Envelope::call(method, params, request_id.clone());
        let body = encode(&envelope).map_err(CallError::Encode)?;

        let receiver = self
            .registry
            .register(request_id.clone(), method, self.call_timeout)?;

        if let Err(e) = self.transport.send(&self.send_queue, body).await {
            self.registry.cancel(&request_id);
            metric_inc!(metrics::TRANSPORT_ERRORS, &["send"]);
            warn!(
                request_id = %request_id,
                method = method,
                queue = %self.send_queue,
                error = %e,
                "Failed to send call"
            );
            return Err(CallError::Send(e));
        }

        metric_inc!(metrics::CALLS_SENT);
        debug!(
            request_id = %request_id,
            method = method,
            queue = %self.send_queue,
            "Call sent"
        );

        Ok(PendingCall {
            request_id,
            method: method.to_string(),
            receiver,
            timeout: self.call_timeout,
            registry: self.registry.clone(),
        })
    }

    /// Handle bound to one remote method name
    pub fn method(&self, name: impl Into<String>) -> RemoteMethod {
        RemoteMethod {
            caller: self.clone(),
            name: name.into(),
        }
    }
}

/// A sent call whose callback has not been awaited yet.
#[must_use = "a pending call does nothing unless waited on"]
pub struct PendingCall {
    request_id: RequestId,
    method: String,
    receiver: oneshot::Receiver<Reply>,
    timeout: Option<Duration>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingCall {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Wait for the callback, honouring the call timeout
    pub async fn wait(self) -> Result<Value, CallError> {
        let received = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.registry.expire(&self.request_id);
                    warn!(
                        request_id = %self.request_id,
                        method = %self.method,
                        timeout_ms = timeout.as_millis() as u64,
                        "Call timed out"
                    );
                    return Err(CallError::Timeout {
                        method: self.method,
                        after: timeout,
                    });
                }
            },
            None => self.receiver.await,
        };

        match received {
            Ok(reply) => reply.result,
            Err(_) => Err(CallError::Dropped),
        }
    }
}

/// Callable handle for one remote method.
///
/// ```ignore
/// let add = node.method("add");
/// let sum: i64 = add.invoke_as(vec![json!(2), json!(3)]).await?;
/// ```
#[derive(Clone)]
pub struct RemoteMethod {
    caller: Caller,
    name: String,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn invoke(&self, params: Vec<Value>) -> Result<Value, CallError> {
        self.caller.call(&self.name, params).await
    }

    pub async fn invoke_as<T: DeserializeOwned>(&self, params: Vec<Value>) -> Result<T, CallError> {
        self.caller.call_as(&self.name, params).await
    }

    pub fn invoke_with<F>(&self, params: Vec<Value>, callback: F) -> RequestId
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        self.caller.call_with(self.name.clone(), params, callback)
    }
}
