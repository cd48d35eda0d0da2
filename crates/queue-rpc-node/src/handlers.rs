//! Demo methods served by the node.
//!
//! - `add(a, b)`: integer sum
//! - `fail()`: always fails with `{message: "boom", code: 42}`
//! - `echo(value)`: returns its first argument

use queue_rpc::{callback_handler, handler_fn, parse_args, Completion, MethodTable, RemoteException};
use serde_json::{json, Value};

/// Exception code reported by `fail`
pub const FAIL_CODE: i64 = 42;

pub fn demo_methods() -> MethodTable {
    let mut methods = MethodTable::new();

    methods.register(
        "add",
        handler_fn(|args| async move {
            let (a, b): (i64, i64) = parse_args(args)?;
            a.checked_add(b)
                .map(|sum| json!(sum))
                .ok_or_else(|| RemoteException::invalid_params("sum overflows i64"))
        }),
    );

    methods.register(
        "fail",
        callback_handler(|_args, done: Completion| {
            done.fail(RemoteException::new("boom", FAIL_CODE));
        }),
    );

    methods.register(
        "echo",
        handler_fn(|args: Vec<Value>| async move {
            Ok::<Value, RemoteException>(args.into_iter().next().unwrap_or(Value::Null))
        }),
    );

    methods
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add() {
        let add = demo_methods().get("add").unwrap();
        assert_eq!(add.call(vec![json!(2), json!(3)]).await.unwrap(), json!(5));
        assert!(add.call(vec![json!(i64::MAX), json!(1)]).await.is_err());
        assert!(add.call(vec![json!("2")]).await.is_err());
    }

    #[tokio::test]
    async fn test_fail() {
        let err = demo_methods()
            .get("fail")
            .unwrap()
            .call(vec![])
            .await
            .unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.code_i64(), Some(FAIL_CODE));
    }

    #[tokio::test]
    async fn test_echo() {
        let echo = demo_methods().get("echo").unwrap();
        assert_eq!(echo.call(vec![json!({"k": 1})]).await.unwrap(), json!({"k": 1}));
        assert_eq!(echo.call(vec![]).await.unwrap(), Value::Null);
    }

    #[test]
    fn test_registered_names() {
        assert_eq!(demo_methods().names(), vec!["add", "echo", "fail"]);
    }
}
