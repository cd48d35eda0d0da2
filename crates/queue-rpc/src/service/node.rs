//! The RPC node: one peer's half of the conversation.
//!
//! Wires the caller, the correlation registry, the dispatcher and the retry
//! scheduler around a single transport. A node sends calls and callbacks to
//! `send_queue` and polls `receive_queue`; its peer uses the same two queues
//! swapped.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::domain::{CallError, RequestId, RpcConfig, RpcError};
use crate::ports::{MethodHandler, QueueTransport};
use crate::service::caller::{Caller, RemoteMethod};
use crate::service::dispatch::Dispatcher;
use crate::service::events::{EventPublisher, RpcEvent};
use crate::service::inbound::InboundLoop;
use crate::service::methods::MethodTable;
use crate::service::pending::{sweep_task, CorrelationRegistry, RegistryStatsSnapshot};
use crate::service::scheduler::{
    RetryScheduler, SchedulerConfig, SchedulerStats, SchedulerStatsSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Idle,
    Running,
    Stopped,
}

/// Builder for [`RpcNode`]
pub struct RpcNodeBuilder {
    config: RpcConfig,
    transport: Option<Arc<dyn QueueTransport>>,
    methods: MethodTable,
}

impl RpcNodeBuilder {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            transport: None,
            methods: MethodTable::new(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn QueueTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a local method. A later registration under the same name wins.
    pub fn method<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: MethodHandler + 'static,
    {
        self.methods.register(name, handler);
        self
    }

    /// Replace the method table
    pub fn methods(mut self, methods: MethodTable) -> Self {
        self.methods = methods;
        self
    }

    pub fn build(self) -> Result<RpcNode, RpcError> {
        self.config.validate()?;
        let transport = self.transport.ok_or(RpcError::MissingTransport)?;
        Ok(RpcNode::new(self.config, transport, self.methods))
    }
}

/// An RPC peer bound to a transport and a pair of queues.
pub struct RpcNode {
    config: RpcConfig,
    transport: Arc<dyn QueueTransport>,
    registry: Arc<CorrelationRegistry>,
    events: Arc<EventPublisher>,
    dispatcher: Dispatcher,
    caller: Caller,
    scheduler_stats: Arc<SchedulerStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<NodeState>,
}

impl RpcNode {
    pub fn builder(config: RpcConfig) -> RpcNodeBuilder {
        RpcNodeBuilder::new(config)
    }

    fn new(config: RpcConfig, transport: Arc<dyn QueueTransport>, methods: MethodTable) -> Self {
        let registry = Arc::new(CorrelationRegistry::new());
        let events = Arc::new(EventPublisher::new(config.event_capacity));
        let dispatcher = Dispatcher::new(
            transport.clone(),
            registry.clone(),
            Arc::new(methods),
            events.clone(),
            &config.send_queue,
            &config.receive_queue,
            config.unregistered_method,
        );
        let caller = Caller::new(
            transport.clone(),
            registry.clone(),
            &config.send_queue,
            config.call_timeout,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            transport,
            registry,
            events,
            dispatcher,
            caller,
            scheduler_stats: Arc::new(SchedulerStats::default()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            state: Mutex::new(NodeState::Idle),
        }
    }

    /// Start polling the receive queue.
    ///
    /// Must be called from within a Tokio runtime. A node starts once.
    pub fn start(&self) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock();
            if *state != NodeState::Idle {
                return Err(RpcError::AlreadyStarted);
            }
            *state = NodeState::Running;
        }

        let inbound = InboundLoop::new(
            self.transport.clone(),
            self.dispatcher.clone(),
            self.events.clone(),
            self.config.receive_queue.clone(),
            self.config.poll_wait,
        );
        let scheduler = RetryScheduler::new(
            Arc::new(inbound),
            SchedulerConfig::from(&self.config),
            self.events.clone(),
        )
        .with_stats(self.scheduler_stats.clone());

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(scheduler.run(self.shutdown.subscribe())));

        if self.config.call_timeout.is_some() {
            tasks.push(tokio::spawn(sweep_task(
                self.registry.clone(),
                self.config.sweep_interval,
                self.shutdown.subscribe(),
            )));
        }

        info!(
            send_queue = %self.config.send_queue,
            receive_queue = %self.config.receive_queue,
            concurrency = self.config.concurrency,
            pollers = self.config.pollers,
            "RPC node started"
        );
        Ok(())
    }

    /// Stop polling and fail every outstanding call with `CallError::Dropped`.
    ///
    /// Handlers already running finish in the background. Calling this more
    /// than once is harmless.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == NodeState::Stopped {
                return;
            }
            *state = NodeState::Stopped;
        }

        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        let dropped = self.registry.clear();
        info!(
            dropped_calls = dropped,
            running_handlers = self.dispatcher.in_flight(),
            "RPC node stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == NodeState::Running
    }

    /// Call `method` on the peer and wait for its result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.caller.call(method, params).await
    }

    /// Call and deserialize the result into `T`
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, CallError> {
        self.caller.call_as(method, params).await
    }

    /// Call without awaiting; `callback` receives the outcome exactly once.
    pub fn call_with<F>(&self, method: &str, params: Vec<Value>, callback: F) -> RequestId
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        self.caller.call_with(method, params, callback)
    }

    /// Callable handle for a remote method
    pub fn method(&self, name: impl Into<String>) -> RemoteMethod {
        self.caller.method(name)
    }

    /// Cloneable handle for issuing calls from other tasks
    pub fn caller(&self) -> Caller {
        self.caller.clone()
    }

    /// Subscribe to events the node observed but did not surface to callers
    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn pending_calls(&self) -> usize {
        self.registry.pending_count()
    }

    pub fn registry_stats(&self) -> RegistryStatsSnapshot {
        self.registry.snapshot()
    }

    pub fn scheduler_stats(&self) -> SchedulerStatsSnapshot {
        self.scheduler_stats.snapshot()
    }

    /// Local handlers currently running
    pub fn running_handlers(&self) -> usize {
        self.dispatcher.in_flight()
    }
}

impl Drop for RpcNode {
    fn drop(&mut self) {
        // Background tasks hold their own handles; stop them with the node
        self.shutdown.send_replace(true);
    }
}
