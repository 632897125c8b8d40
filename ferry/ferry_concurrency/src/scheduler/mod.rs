//! Task execution and composable execution chains.
//!
//! This module provides the building blocks for multi-stage pipelines:
//!
//! - Deferred tasks and runners, including a FIFO-serializing runner
//! - Sequential chain nodes that pass each result to the next step
//! - Bounded parallel fan-out with ordered fan-in

pub mod chain;
pub mod parallel;
pub mod task;

// Re-export key types from chain
pub use chain::{ChainFactory, ExecutionNode, NodeKind, SequentialExecution};

// Re-export key types from parallel
pub use parallel::ParallelExecution;

// Re-export key types from task
pub use task::{Runner, SerializingRunner, Task};
