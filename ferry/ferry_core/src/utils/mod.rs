//! Utility types used throughout Ferry: configuration and logging helpers.

pub mod config;
pub mod logging;

pub use config::{ExecutionConfig, FerryConfig, InitPolicy, PoolConfig};
pub use logging::LogLevel;
