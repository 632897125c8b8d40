//! Strongly-typed identifiers.
//!
//! Each identifier is a thin wrapper around a UUID with a phantom marker so
//! that task identifiers and claim identifiers cannot be mixed up.
//!
//! # Examples
//!
//! ```
//! use ferry_core::id::{ClaimId, TaskId};
//! use std::str::FromStr;
//!
//! let task_id = TaskId::new();
//! let claim_id = ClaimId::new();
//! assert_ne!(task_id.to_string(), claim_id.to_string());
//!
//! let id_str = "550e8400-e29b-41d4-a716-446655440000";
//! let task_id = TaskId::from_str(id_str).unwrap();
//! assert_eq!(task_id.to_string(), id_str);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

/// A type-safe identifier based on UUID.
pub struct Id<T> {
    uuid: Uuid,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    /// Create a new random identifier.
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Create an identifier from a specific UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: PhantomData,
        }
    }

    /// Get the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The first eight hex digits, enough to tell ids apart in log lines.
    pub fn short(&self) -> String {
        self.uuid.simple().to_string()[..8].to_string()
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.uuid)
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_uuid(Uuid::parse_str(s)?))
    }
}

/// Marker type for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskMarker;
/// Identifier for a task.
pub type TaskId = Id<TaskMarker>;

/// Marker type for claim attempts against a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimMarker;
/// Identifier for one waiting claim.
pub type ClaimId = Id<ClaimMarker>;
