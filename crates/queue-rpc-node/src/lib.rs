//! # Queue-RPC Node
//!
//! Process wiring for a Queue-RPC node.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration from the environment
//! 2. Initialise telemetry (logging, metrics)
//! 3. Build the node over the transport and register the demo methods
//! 4. Start polling (and the loopback peer, if enabled)
//! 5. Run until Ctrl+C, then shut down
//!
//! ## Modules
//!
//! - `config` - environment configuration
//! - `handlers` - demo methods (`add`, `fail`, `echo`)
//! - `runtime` - node lifecycle

pub mod config;
pub mod handlers;
pub mod runtime;

pub use config::NodeConfig;
pub use handlers::demo_methods;
pub use runtime::{DemoReport, NodeRuntime};
