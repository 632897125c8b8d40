//! Traits that backend collaborators implement.
//!
//! - `Resource`: the capability interface for anything a pool hands out

pub mod resource;

pub use resource::{Capabilities, Operation, Resource};
