//! Adapters Layer
//!
//! Queue transport implementations.

pub mod memory;

pub use memory::{InMemoryQueue, QueueCounters};
