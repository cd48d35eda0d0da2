//! Service Layer
//!
//! - `caller`: outbound calls and their waiters
//! - `pending`: correlation registry
//! - `dispatch`: routing of inbound envelopes
//! - `inbound`: one poll cycle
//! - `scheduler`: keeps poll cycles running forever
//! - `node`: the public facade tying it together

pub mod caller;
pub mod dispatch;
pub mod events;
pub mod inbound;
pub mod methods;
pub mod node;
pub mod pending;
pub mod scheduler;

pub use caller::{Caller, PendingCall, RemoteMethod};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use events::{EventPublisher, RpcEvent, TransportOperation};
pub use inbound::{CycleOutcome, InboundLoop};
pub use methods::MethodTable;
pub use node::{RpcNode, RpcNodeBuilder};
pub use pending::{
    sweep_task, CorrelationRegistry, RegistryStats, RegistryStatsSnapshot, Reply,
};
pub use scheduler::{
    CycleJob, RetryScheduler, SchedulerConfig, SchedulerStats, SchedulerStatsSnapshot,
};
