//! # Node Runtime
//!
//! Owns the broker, the served node and (optionally) a loopback peer:
//!
//! ```text
//!   loopback ── send ──► receive_queue ──► node (demo methods)
//!   loopback ◄── send_queue ◄── send ──── node
//! ```
//!
//! Observer events from both nodes are drained into the log.

use std::sync::Arc;

use anyhow::{Context, Result};
use queue_rpc::{InMemoryQueue, RemoteException, RpcEvent, RpcNode};
use queue_telemetry::log_rpc_event;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::handlers::demo_methods;

/// Outcome of the loopback demo calls
#[derive(Debug, Clone, PartialEq)]
pub struct DemoReport {
    pub sum: i64,
    pub failure: RemoteException,
    pub echo: Value,
}

/// The running process: broker, served node, loopback peer.
pub struct NodeRuntime {
    broker: Arc<InMemoryQueue>,
    node: RpcNode,
    loopback: Option<RpcNode>,
    observers: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        config.validate().context("invalid node configuration")?;
        info!("Creating Queue-RPC node runtime");

        let broker = Arc::new(InMemoryQueue::new());

        let node = RpcNode::builder(config.rpc.clone())
            .transport(broker.clone())
            .methods(demo_methods())
            .build()
            .context("failed to build RPC node")?;

        let loopback = if config.loopback_demo {
            Some(
                RpcNode::builder(config.loopback_rpc())
                    .transport(broker.clone())
                    .build()
                    .context("failed to build loopback node")?,
            )
        } else {
            None
        };

        Ok(Self {
            broker,
            node,
            loopback,
            observers: Vec::new(),
        })
    }

    /// Start polling on every node and begin logging their events.
    pub fn start(&mut self) -> Result<()> {
        self.observers
            .push(tokio::spawn(log_events("node", self.node.subscribe())));
        self.node.start().context("failed to start RPC node")?;

        if let Some(loopback) = &self.loopback {
            self.observers
                .push(tokio::spawn(log_events("loopback", loopback.subscribe())));
            loopback.start().context("failed to start loopback node")?;
        }

        let config = self.node.config();
        info!(
            send_queue = %config.send_queue,
            receive_queue = %config.receive_queue,
            loopback = self.loopback.is_some(),
            "Node runtime started"
        );
        Ok(())
    }

    /// Call each demo method once through the loopback peer.
    pub async fn run_demo(&self) -> Result<DemoReport> {
        let loopback = self
            .loopback
            .as_ref()
            .context("loopback demo is disabled")?;

        let sum: i64 = loopback
            .call_as("add", vec![json!(2), json!(3)])
            .await
            .context("add failed")?;
        info!(sum = sum, "add(2, 3)");

        let failure = match loopback.call("fail", vec![]).await {
            Err(e) => e
                .remote()
                .cloned()
                .context("fail returned a non-remote error")?,
            Ok(value) => anyhow::bail!("fail unexpectedly succeeded with {}", value),
        };
        info!(message = %failure.message, code = ?failure.code, "fail()");

        let echo = loopback
            .call("echo", vec![json!("hello")])
            .await
            .context("echo failed")?;
        info!(echo = %echo, "echo(\"hello\")");

        Ok(DemoReport { sum, failure, echo })
    }

    pub fn node(&self) -> &RpcNode {
        &self.node
    }

    pub fn broker(&self) -> &Arc<InMemoryQueue> {
        &self.broker
    }

    /// Stop every node and the event loggers.
    pub async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");

        if let Some(loopback) = &self.loopback {
            loopback.shutdown().await;
        }
        self.node.shutdown().await;

        for observer in self.observers.drain(..) {
            observer.abort();
        }

        info!("Node runtime stopped");
    }
}

/// Drain one node's observer channel into the log
async fn log_events(node: &'static str, mut events: broadcast::Receiver<RpcEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(node, event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log_rpc_event!(warn, "observer", "Observer lagged, events skipped", node = node, skipped = skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(node: &'static str, event: RpcEvent) {
    match event {
        RpcEvent::DecodeFailed {
            receipt_handle,
            error,
        } => {
            log_rpc_event!(warn, "dispatch", "Undecodable message discarded", node = node, receipt_handle = %receipt_handle, error = %error);
        }
        RpcEvent::TransportFailed { operation, error } => {
            log_rpc_event!(warn, "transport", "Transport operation failed", node = node, operation = %operation, error = %error);
        }
        RpcEvent::UnknownCallback { request_id, method } => {
            log_rpc_event!(debug, "dispatch", "Callback for unknown request", node = node, request_id = %request_id, method = %method);
        }
        RpcEvent::UnregisteredMethod { method, request_id } => {
            log_rpc_event!(warn, "dispatch", "Call to unregistered method", node = node, method = %method, request_id = %request_id);
        }
        RpcEvent::HandlerPanicked { method, request_id } => {
            log_rpc_event!(error, "dispatch", "Handler panicked", node = node, method = %method, request_id = %request_id);
        }
        RpcEvent::ReplyFailed { request_id, error } => {
            log_rpc_event!(error, "dispatch", "Reply could not be sent", node = node, request_id = %request_id, error = %error);
        }
        RpcEvent::SchedulerStats(stats) => {
            log_rpc_event!(debug, "scheduler", "Scheduler stats observed", node = node, total = stats.total, failed = stats.failed);
        }
        RpcEvent::SchedulerStatsReset(stats) => {
            log_rpc_event!(debug, "scheduler", "Scheduler stats reset observed", node = node, total = stats.total);
        }
    }
}
