//! Error types for the RPC core.
//!
//! Failures are split by who gets to see them:
//! - `DecodeError` and `TransportError` stay inside the inbound loop
//! - `RemoteException` travels across the queue inside a callback envelope
//! - `CallError` is what an application caller receives

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::correlation::RequestId;

/// Reserved exception codes for failures synthesised by the RPC layer itself
pub mod codes {
    /// No handler registered for the method (opt-in reply policy)
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Call arguments did not match what the handler expected
    pub const INVALID_PARAMS: i64 = -32602;
    /// Handler panicked or dropped its completion
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Code attached to a remote exception.
///
/// Peers report numeric or symbolic codes, and occasionally anything else a
/// JSON value can hold. All of them are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExceptionCode {
    /// Numeric code, e.g. `42`
    Number(i64),
    /// Symbolic code, e.g. `"ENOENT"`
    Text(String),
    /// Floats, booleans, objects, integers beyond `i64`
    Other(Value),
}

impl ExceptionCode {
    /// Numeric value, if the code is numeric
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ExceptionCode::Number(n) => Some(*n),
            ExceptionCode::Text(_) | ExceptionCode::Other(_) => None,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::Number(n) => write!(f, "{}", n),
            ExceptionCode::Text(s) => f.write_str(s),
            ExceptionCode::Other(value) => write!(f, "{}", value),
        }
    }
}

impl From<i64> for ExceptionCode {
    fn from(code: i64) -> Self {
        ExceptionCode::Number(code)
    }
}

impl From<&str> for ExceptionCode {
    fn from(code: &str) -> Self {
        ExceptionCode::Text(code.to_string())
    }
}

/// Handler-reported failure carried back to the caller as `{message, code}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    /// Human readable message. `null` reads as empty, other non-strings are
    /// kept in their JSON text form.
    #[serde(default, deserialize_with = "message_text")]
    pub message: String,
    /// Optional code, forwarded verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ExceptionCode>,
}

fn message_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(message) => message,
        other => other.to_string(),
    })
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "remote exception [{}]: {}", code, self.message),
            None => write!(f, "remote exception: {}", self.message),
        }
    }
}

impl std::error::Error for RemoteException {}

impl RemoteException {
    /// Create an exception with a code
    pub fn new(message: impl Into<String>, code: impl Into<ExceptionCode>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Create an exception without a code
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Internal failure of the callee (panic, dropped completion)
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(details, codes::INTERNAL_ERROR)
    }

    /// Arguments did not deserialize into what the handler expected
    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(
            format!("Invalid params: {}", details.into()),
            codes::INVALID_PARAMS,
        )
    }

    /// No handler for the method
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            format!("Method not found: {}", method),
            codes::METHOD_NOT_FOUND,
        )
    }

    /// Numeric code, if any
    pub fn code_i64(&self) -> Option<i64> {
        self.code.as_ref().and_then(ExceptionCode::as_i64)
    }

    /// An exception only counts as a failure when it carries a message
    pub fn is_failure(&self) -> bool {
        !self.message.is_empty()
    }
}

/// Inbound message body that cannot be turned into an envelope.
///
/// Terminal for that message: it is deleted and never retried.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("call to {method} carries params that are not an argument list")]
    InvalidParams { method: String },
}

/// Errors reported by a queue transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Error response from the queue service
    #[error("queue error {code}: {message}")]
    Queue { code: i64, message: String },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Conventional code the queue service uses for an empty long-poll
    pub const NO_MESSAGE_CODE: i64 = 7000;

    /// The "no message available" response some queue services report
    /// as an error.
    pub fn no_message() -> Self {
        TransportError::Queue {
            code: Self::NO_MESSAGE_CODE,
            message: "(10200)no message".to_string(),
        }
    }

    /// Returns true if this is the empty-queue signal rather than a failure
    pub fn is_empty_queue(&self) -> bool {
        match self {
            TransportError::Queue { message, .. } | TransportError::Unavailable(message) => {
                message.to_lowercase().contains("no message")
            }
            _ => false,
        }
    }
}

/// Failure observed by an application caller.
#[derive(Debug, Error)]
pub enum CallError {
    /// The callee's handler reported a failure
    #[error(transparent)]
    Remote(#[from] RemoteException),

    #[error("call to {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("failed to send call: {0}")]
    Send(#[source] TransportError),

    #[error("failed to encode call: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode result: {0}")]
    Decode(#[source] serde_json::Error),

    /// Waiter was discarded without a callback (node shut down)
    #[error("call dropped before a callback arrived")]
    Dropped,

    #[error("request id already in flight: {0}")]
    DuplicateRequestId(RequestId),
}

impl CallError {
    /// The remote exception, if the callee reported one
    pub fn remote(&self) -> Option<&RemoteException> {
        match self {
            CallError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid node configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid queue name for {field}: must not be empty")]
    EmptyQueueName { field: &'static str },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Node lifecycle errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("node already started")]
    AlreadyStarted,

    #[error("node not started")]
    NotStarted,

    #[error("no transport configured")]
    MissingTransport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_queue_signal_recognised() {
        assert!(TransportError::no_message().is_empty_queue());
        assert!(TransportError::Queue {
            code: 7000,
            message: "No Message in queue".into()
        }
        .is_empty_queue());
        assert!(!TransportError::Queue {
            code: 4000,
            message: "access denied".into()
        }
        .is_empty_queue());
        assert!(!TransportError::QueueNotFound("no message".into()).is_empty_queue());
    }

    #[test]
    fn test_exception_code_serialization() {
        let numeric = RemoteException::new("boom", 42);
        let json = serde_json::to_value(&numeric).unwrap();
        assert_eq!(json, serde_json::json!({"message": "boom", "code": 42}));

        let symbolic: RemoteException =
            serde_json::from_value(serde_json::json!({"message": "gone", "code": "ENOENT"}))
                .unwrap();
        assert_eq!(symbolic.code, Some(ExceptionCode::Text("ENOENT".into())));
        assert_eq!(symbolic.code_i64(), None);
    }

    #[test]
    fn test_unusual_codes_carried_verbatim() {
        for code in [
            serde_json::json!(1.5),
            serde_json::json!(true),
            serde_json::json!({"k": 1}),
            serde_json::json!(u64::MAX),
        ] {
            let exception: RemoteException =
                serde_json::from_value(serde_json::json!({"message": "boom", "code": code}))
                    .unwrap();
            assert_eq!(exception.code, Some(ExceptionCode::Other(code.clone())));
            assert_eq!(exception.code_i64(), None);
            assert_eq!(serde_json::to_value(&exception).unwrap()["code"], code);
        }
    }

    #[test]
    fn test_null_or_missing_message_reads_as_empty() {
        let exception: RemoteException =
            serde_json::from_value(serde_json::json!({"message": null, "code": 3})).unwrap();
        assert_eq!(exception.message, "");
        assert!(!exception.is_failure());

        let exception: RemoteException =
            serde_json::from_value(serde_json::json!({"code": "E"})).unwrap();
        assert_eq!(exception.message, "");

        let exception: RemoteException =
            serde_json::from_value(serde_json::json!({"message": 500})).unwrap();
        assert_eq!(exception.message, "500");
        assert!(exception.is_failure());
    }

    #[test]
    fn test_exception_without_code_omits_field() {
        let json = serde_json::to_value(RemoteException::message("plain")).unwrap();
        assert_eq!(json, serde_json::json!({"message": "plain"}));
    }

    #[test]
    fn test_is_failure_requires_message() {
        assert!(RemoteException::new("boom", 1).is_failure());
        assert!(!RemoteException::new("", 1).is_failure());
    }

    #[test]
    fn test_reserved_codes() {
        assert_eq!(
            RemoteException::method_not_found("nope").code_i64(),
            Some(codes::METHOD_NOT_FOUND)
        );
        assert_eq!(
            RemoteException::internal("panic").code_i64(),
            Some(codes::INTERNAL_ERROR)
        );
        assert!(RemoteException::invalid_params("x")
            .message
            .starts_with("Invalid params"));
    }

    #[test]
    fn test_call_error_exposes_remote() {
        let err = CallError::from(RemoteException::new("boom", 42));
        let remote = err.remote().unwrap();
        assert_eq!(remote.message, "boom");
        assert_eq!(remote.code_i64(), Some(42));
    }
}
