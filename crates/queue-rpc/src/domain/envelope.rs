//! Wire envelope and its JSON codec.
//!
//! One flat JSON object per queue message:
//!
//! ```text
//! {"action":"call","method":"add","params":[2,3],"request_id":"…"}
//! {"action":"callback","method":"add","params":5,"request_id":"…"}
//! {"action":"callback","method":"fail","request_id":"…","exception":{"message":"boom","code":42}}
//! ```
//!
//! For calls `params` is the positional argument list. For callbacks it is the
//! handler's single result value. `exception` is omitted when there is none.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::correlation::RequestId;
use crate::domain::error::{DecodeError, RemoteException};

/// Distinguishes calls from their replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Invoke a method on the peer
    Call,
    /// Reply to a previously sent call
    Callback,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Call => "call",
            Action::Callback => "callback",
        }
    }
}

/// The wire unit carrying one RPC call or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteException>,
}

impl Envelope {
    /// Build a call envelope
    pub fn call(method: impl Into<String>, args: Vec<Value>, request_id: RequestId) -> Self {
        Self {
            action: Action::Call,
            method: method.into(),
            params: Value::Array(args),
            request_id,
            exception: None,
        }
    }

    /// Build the reply to a call from the handler's outcome.
    ///
    /// A failed outcome carries no result: `params` is sent as `null` next to
    /// the exception, and callers only ever see the exception.
    pub fn callback(
        method: impl Into<String>,
        request_id: RequestId,
        outcome: Result<Value, RemoteException>,
    ) -> Self {
        let (params, exception) = match outcome {
            Ok(value) => (value, None),
            Err(exception) => (Value::Null, Some(exception)),
        };
        Self {
            action: Action::Callback,
            method: method.into(),
            params,
            request_id,
            exception,
        }
    }

    /// Positional arguments of a call. Missing params mean no arguments.
    pub fn args(&self) -> Vec<Value> {
        match &self.params {
            Value::Array(args) => args.clone(),
            _ => Vec::new(),
        }
    }

    /// What a callback resolves its waiter with.
    ///
    /// An exception only counts when it carries a message, otherwise the
    /// params are the result.
    pub fn outcome(&self) -> Result<Value, RemoteException> {
        match &self.exception {
            Some(exception) if exception.is_failure() => Err(exception.clone()),
            _ => Ok(self.params.clone()),
        }
    }

    pub fn is_call(&self) -> bool {
        self.action == Action::Call
    }
}

/// Serialize an envelope to its message body.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parse a message body into an envelope.
///
/// A call whose params are neither an array nor absent is rejected here, so
/// the dispatcher never sees an argument list it cannot spread.
pub fn decode(body: &str) -> Result<Envelope, DecodeError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    if envelope.is_call() && !matches!(envelope.params, Value::Array(_) | Value::Null) {
        return Err(DecodeError::InvalidParams {
            method: envelope.method,
        });
    }
    Ok(envelope)
}
