#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Ferry Core
//!
//! `ferry_core` holds the pieces every Ferry crate and every backend driver
//! agrees on: the error taxonomy, typed identifiers, the `Resource`
//! capability trait that pooled backends implement, configuration, and
//! logging helpers.
//!
//! ## Crate Structure
//!
//! - **error**: Error types for pools, execution chains and resources
//! - **id**: Strongly-typed identifier types
//! - **traits**: The `Resource` capability interface
//! - **utils**: Configuration loading and logging helpers
//! - **macros**: `log_event!` for structured log records

pub mod error;
pub mod id;
pub mod macros;
pub mod traits;
pub mod utils;

#[doc(hidden)]
pub use log as __log;

pub use error::{Error, Result};
pub use id::{ClaimId, TaskId};
pub use traits::{Capabilities, Operation, Resource};
pub use utils::{ExecutionConfig, FerryConfig, InitPolicy, LogLevel, PoolConfig};
