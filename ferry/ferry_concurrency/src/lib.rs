#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Ferry Concurrency
//!
//! Resource pooling and execution chains for the Ferry migration toolkit.
//!
//! This crate provides the concurrency core that pipelines are built on:
//!
//! - A bounded pool of backend resources with blocking, time-limited claims
//! - Deferred tasks and serializing runners
//! - Lazy sequential chains and bounded parallel fan-out/fan-in
//!
//! Pools and chains are independent. They meet in caller code, typically a
//! task body that claims a resource:
//!
//! ```
//! use ferry_concurrency::scheduler::ChainFactory;
//!
//! let chain = ChainFactory::default();
//! let node = chain.parallel(2).unwrap();
//! for page in 0..4u32 {
//!     node.run(move || Ok(page * 10)).unwrap();
//! }
//! let pages = node.then(|pages| Ok(pages.len())).get().unwrap();
//! assert_eq!(pages, vec![4]);
//! ```
//!
//! ## Integration with Other Ferry Crates
//!
//! - **ferry_core**: errors, identifiers, the `Resource` trait and configuration

/// Bounded resource pooling with claim/release semantics
pub mod pool;

/// Tasks, runners and execution chains
pub mod scheduler;

// Re-export key types for easier access
pub use pool::{PooledHandle, ResourcePool};
pub use scheduler::{ChainFactory, ParallelExecution, SequentialExecution};
