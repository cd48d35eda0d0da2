//! Inbound Ports (Driving Ports)
//!
//! Local method handlers the dispatch engine invokes for incoming calls.
//!
//! Two handler styles are supported:
//! - async: [`handler_fn`] wraps `async |args| -> Result<Value, RemoteException>`
//! - completion callback: [`callback_handler`] wraps `|args, done| { ... }`,
//!   where `done` may be moved into another task and completed later

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use tokio::sync::oneshot;

use crate::domain::RemoteException;

/// A locally registered method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the method with the call's positional arguments.
    ///
    /// `Err` is sent back to the caller as the callback's exception.
    async fn call(&self, args: Vec<Value>) -> Result<Value, RemoteException>;
}

/// Handler backed by an async closure
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RemoteException>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, RemoteException> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RemoteException>> + Send,
{
    FnHandler(f)
}

/// Single-shot completion handed to callback-style handlers.
///
/// Completing consumes it, so a handler cannot reply twice. Dropping it
/// without completing replies with an internal error.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Result<Value, RemoteException>>,
}

impl Completion {
    /// Complete with the handler's outcome
    pub fn done(self, result: Result<Value, RemoteException>) {
        // The receiver only disappears when the reply pipeline was torn down.
        let _ = self.tx.send(result);
    }

    /// Complete successfully
    pub fn ok(self, value: Value) {
        self.done(Ok(value))
    }

    /// Complete with a failure
    pub fn fail(self, exception: RemoteException) {
        self.done(Err(exception))
    }
}

/// Handler backed by a completion-callback closure
pub struct CallbackHandler<F>(F);

#[async_trait]
impl<F> MethodHandler for CallbackHandler<F>
where
    F: Fn(Vec<Value>, Completion) + Send + Sync,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, RemoteException> {
        let (tx, rx) = oneshot::channel();
        (self.0)(args, Completion { tx });
        rx.await.unwrap_or_else(|_| {
            Err(RemoteException::internal(
                "handler dropped its completion without replying",
            ))
        })
    }
}

/// Wrap a completion-callback closure as a handler.
pub fn callback_handler<F>(f: F) -> CallbackHandler<F>
where
    F: Fn(Vec<Value>, Completion) + Send + Sync,
{
    CallbackHandler(f)
}

/// Deserialize positional arguments into a tuple or struct.
///
/// ```ignore
/// let (a, b): (i64, i64) = parse_args(args)?;
/// ```
pub fn parse_args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T, RemoteException> {
    serde_json::from_value(Value::Array(args))
        .map_err(|e| RemoteException::invalid_params(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn() {
        let add = handler_fn(|args: Vec<Value>| async move {
            let (a, b): (i64, i64) = parse_args(args)?;
            Ok::<Value, RemoteException>(json!(a + b))
        });
        assert_eq!(add.call(vec![json!(2), json!(3)]).await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_parse_args_mismatch() {
        let add = handler_fn(|args: Vec<Value>| async move {
            let (a, b): (i64, i64) = parse_args(args)?;
            Ok::<Value, RemoteException>(json!(a + b))
        });
        let err = add.call(vec![json!("two")]).await.unwrap_err();
        assert_eq!(err.code_i64(), Some(crate::domain::codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_callback_handler_completes_from_other_task() {
        let later = callback_handler(|args: Vec<Value>, done: Completion| {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                done.ok(json!(args.len()));
            });
        });
        assert_eq!(later.call(vec![json!(1), json!(2)]).await, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_callback_handler_failure() {
        let fail = callback_handler(|_args, done: Completion| {
            done.fail(RemoteException::new("boom", 42));
        });
        let err = fail.call(vec![]).await.unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.code_i64(), Some(42));
    }

    #[tokio::test]
    async fn test_dropped_completion_is_internal_error() {
        let forgetful = callback_handler(|_args, _done: Completion| {});
        let err = forgetful.call(vec![]).await.unwrap_err();
        assert_eq!(err.code_i64(), Some(crate::domain::codes::INTERNAL_ERROR));
    }
}
