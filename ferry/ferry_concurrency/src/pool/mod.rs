//! Resource pooling for expensive backend sessions.
//!
//! This module provides the bounded pool itself and the statistics it
//! reports:
//!
//! - A fixed-capacity resource pool with blocking, time-limited claims
//! - Handles that return their resource on release or drop
//! - Pluggable sinks for the periodic occupancy record

pub mod resource;
pub mod stats;

// Re-export key types from resource
pub use resource::{PooledHandle, ResourcePool, ResourcePoolBuilder};

// Re-export key types from stats
pub use stats::{LogStatsSink, NoopStatsSink, PoolStats, StatsSink};
