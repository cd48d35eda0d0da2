//! # Inbound Loop Resilience Tests
//!
//! The inbound loop must survive anything the queue hands it: garbage
//! bodies, duplicate callbacks, a transport that keeps failing. These tests
//! drive one node directly through the broker and run on a paused clock so
//! retry delays and long-polls cost nothing.

use std::sync::Arc;
use std::time::Duration;

use queue_rpc::{
    decode, encode, handler_fn, json, parse_args, Action, Envelope, InMemoryQueue, RemoteException,
    RequestId, RpcConfig, RpcEvent, RpcNode, TransportError, Value,
};

const PEER_IN: &str = "peer-in";
const NODE_IN: &str = "node-in";

fn node(broker: &Arc<InMemoryQueue>) -> RpcNode {
    let node = RpcNode::builder(RpcConfig::new(PEER_IN, NODE_IN))
        .transport(broker.clone())
        .method(
            "add",
            handler_fn(|args| async move {
                let (a, b): (i64, i64) = parse_args(args)?;
                Ok::<Value, RemoteException>(json!(a + b))
            }),
        )
        .build()
        .expect("valid config");
    node.start().expect("node starts");
    node
}

fn push_call(broker: &InMemoryQueue, method: &str, args: Vec<Value>, id: &str) {
    let call = Envelope::call(method, args, RequestId::from(id));
    broker.push_raw(NODE_IN, encode(&call).unwrap());
}

fn replies(broker: &InMemoryQueue) -> Vec<Envelope> {
    broker
        .peek_all(PEER_IN)
        .iter()
        .map(|body| decode(body).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_poison_messages_deleted_once_without_reply() {
    let broker = Arc::new(InMemoryQueue::new());
    let node = node(&broker);
    let mut observer = node.subscribe();

    broker.push_raw(NODE_IN, "not json at all");
    broker.push_raw(
        NODE_IN,
        r#"{"action":"call","method":"add","params":7,"request_id":"x"}"#,
    );
    broker.push_raw(
        NODE_IN,
        r#"{"action":"shout","method":"add","params":[],"request_id":"y"}"#,
    );
    tokio::time::sleep(Duration::from_secs(1)).await;

    let counters = broker.counters(NODE_IN);
    assert_eq!(counters.received, 3);
    assert_eq!(counters.deleted, 3);
    assert_eq!(broker.counters(PEER_IN).sent, 0);

    for _ in 0..3 {
        assert!(matches!(
            observer.try_recv(),
            Ok(RpcEvent::DecodeFailed { .. })
        ));
    }

    // Still serving
    push_call(&broker, "add", vec![json!(2), json!(3)], "after-poison");
    tokio::time::sleep(Duration::from_secs(1)).await;
    let replies = replies(&broker);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].outcome(), Ok(json!(5)));

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_polling_survives_permanent_transport_failure() {
    let broker = Arc::new(InMemoryQueue::new());
    broker.fail_all_receives(TransportError::Unavailable("connection refused".into()));
    let node = node(&broker);

    tokio::time::sleep(Duration::from_secs(31)).await;

    // One attempt every 3 s retry delay
    let attempts = broker.receive_attempts();
    assert!((10..=12).contains(&attempts), "attempts = {}", attempts);
    let stats = node.scheduler_stats();
    assert_eq!(stats.succeeded, 0);
    assert!(stats.failed >= 10);

    // Recovers as soon as the transport does
    broker.clear_faults();
    push_call(&broker, "add", vec![json!(20), json!(22)], "recovered");
    tokio::time::sleep(Duration::from_secs(4)).await;

    let replies = replies(&broker);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].request_id.as_str(), "recovered");
    assert_eq!(replies[0].outcome(), Ok(json!(42)));

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_message_error_is_not_a_failure() {
    let broker = Arc::new(InMemoryQueue::new());
    broker.fail_next_receives(5, TransportError::no_message());
    let node = node(&broker);

    push_call(&broker, "add", vec![json!(1), json!(2)], "quick");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // No retry delay was taken
    assert_eq!(replies(&broker).len(), 1);
    assert_eq!(node.scheduler_stats().failed, 0);

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_callback_fires_once() {
    let broker = Arc::new(InMemoryQueue::new());
    let node = Arc::new(node(&broker));
    let mut observer = node.subscribe();

    let caller = node.clone();
    let call = tokio::spawn(async move { caller.call("remote_add", vec![json!(1)]).await });
    while broker.depth(PEER_IN) == 0 {
        tokio::task::yield_now().await;
    }

    let sent = replies(&broker).remove(0);
    assert_eq!(sent.action, Action::Call);
    for value in [json!("first"), json!("second")] {
        let callback = Envelope::callback("remote_add", sent.request_id.clone(), Ok(value));
        broker.push_raw(NODE_IN, encode(&callback).unwrap());
    }

    assert_eq!(call.await.unwrap().unwrap(), json!("first"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(broker.counters(NODE_IN).deleted, 2);
    assert!(matches!(
        observer.try_recv(),
        Ok(RpcEvent::UnknownCallback { request_id, .. }) if request_id == sent.request_id
    ));
    assert_eq!(node.registry_stats().total_resolved, 1);

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_callback_is_noop() {
    let broker = Arc::new(InMemoryQueue::new());
    let node = node(&broker);

    let callback = Envelope::callback("add", RequestId::from("never-sent"), Ok(json!(1)));
    broker.push_raw(NODE_IN, encode(&callback).unwrap());
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(broker.counters(NODE_IN).deleted, 1);
    assert_eq!(broker.counters(PEER_IN).sent, 0);
    assert_eq!(node.pending_calls(), 0);
    assert_eq!(node.registry_stats().total_unmatched, 1);

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_call_redelivered_when_reply_cannot_be_sent() {
    let broker = Arc::new(InMemoryQueue::new());
    let node = node(&broker);
    broker.fail_sends(TransportError::Unavailable("throttled".into()));

    push_call(&broker, "add", vec![json!(3), json!(4)], "retry-me");
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Not acknowledged: the call is still in flight
    assert_eq!(broker.in_flight(NODE_IN), 1);
    assert_eq!(broker.counters(NODE_IN).deleted, 0);

    // Visibility timeout lapses, transport is back
    broker.clear_faults();
    assert_eq!(broker.requeue_in_flight(NODE_IN), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let replies = replies(&broker);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].outcome(), Ok(json!(7)));
    assert_eq!(broker.counters(NODE_IN).deleted, 1);

    node.shutdown().await;
}
