//! Queue-RPC - Remote procedure calls over an asynchronous message queue.
//!
//! Two peers exchange JSON envelopes through a pair of queues. Each peer
//! sends to the other's receive queue and long-polls its own.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                              RPC NODE                                 │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  call(method, params)                                                 │
//! │     │                                                                 │
//! │     ├─► Correlation Registry (request_id ─► oneshot)                  │
//! │     └─► encode ─► send_queue ──────────────────────────────┐          │
//! │                                                            │          │
//! │  Retry Scheduler (≤ concurrency cycles, retry_delay)       │   PEER   │
//! │     │                                                      │          │
//! │     └─► receive_queue ◄─ long-poll ◄───────────────────────┘          │
//! │            │                                                          │
//! │            ▼                                                          │
//! │        Dispatcher                                                     │
//! │          ├─ callback ─► registry.resolve ─► delete                    │
//! │          └─ call ─► handler ─► callback to send_queue ─► delete       │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A message is deleted only after it has been acted on. A call is
//!   deleted after its callback was sent.
//! - Each request id fires its waiter at most once. Late or duplicate
//!   callbacks are ignored.
//! - Undecodable messages are deleted and never retried.
//! - Transport failures never stop polling; the failed cycle is retried
//!   after `retry_delay`.
//!
//! # Usage
//!
//! ```ignore
//! use queue_rpc::{handler_fn, parse_args, InMemoryQueue, RpcConfig, RpcNode};
//!
//! let broker = Arc::new(InMemoryQueue::new());
//! let server = RpcNode::builder(RpcConfig::new("client-in", "server-in"))
//!     .transport(broker.clone())
//!     .method("add", handler_fn(|args| async move {
//!         let (a, b): (i64, i64) = parse_args(args)?;
//!         Ok(json!(a + b))
//!     }))
//!     .build()?;
//! server.start()?;
//!
//! let client = RpcNode::builder(RpcConfig::new("server-in", "client-in"))
//!     .transport(broker)
//!     .build()?;
//! client.start()?;
//!
//! let sum: i64 = client.call_as("add", vec![json!(2), json!(3)]).await?;
//! ```

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{InMemoryQueue, QueueCounters};
pub use domain::{
    codes, decode, encode, Action, CallError, ConfigError, DecodeError, Envelope, ExceptionCode,
    RemoteException, RequestId, RpcConfig, RpcError, TransportError, UnregisteredMethodPolicy,
    MAX_POLL_WAIT,
};
pub use ports::{
    callback_handler, handler_fn, parse_args, CallbackHandler, Completion, FnHandler,
    MethodHandler, QueueMessage, QueueTransport, ReceiptHandle,
};
pub use service::{
    Caller, CycleOutcome, DispatchOutcome, MethodTable, PendingCall, RegistryStatsSnapshot,
    RemoteMethod, RpcEvent, RpcNode, RpcNodeBuilder, SchedulerStatsSnapshot, TransportOperation,
};

/// Re-exported so handlers can build results without a direct dependency
pub use serde_json::{json, Value};
