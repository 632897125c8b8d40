//! Resource capability trait.
//!
//! A resource is anything a pool hands out for exclusive, temporary use,
//! such as a document-store session or a relational connection. Backends
//! implement [`Resource`] directly and advertise the domain operations they
//! provide through [`Resource::capabilities`], so callers can tell a missing
//! capability apart from a failing one without calling into the backend.
//!
//! # Examples
//!
//! ```
//! use ferry_core::error::Result;
//! use ferry_core::traits::resource::{Capabilities, Operation, Resource};
//!
//! struct Counter {
//!     value: u64,
//! }
//!
//! impl Resource for Counter {
//!     type Request = u64;
//!     type Response = u64;
//!
//!     fn open(&mut self) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     fn close(&mut self) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     fn capabilities(&self) -> Capabilities {
//!         Capabilities::EXECUTE
//!     }
//!
//!     fn execute(&mut self, by: u64) -> Result<u64> {
//!         self.value += by;
//!         Ok(self.value)
//!     }
//! }
//!
//! let mut counter = Counter { value: 0 };
//! assert!(counter.supports(Operation::Execute));
//! assert!(!counter.supports(Operation::Delete));
//! assert_eq!(counter.execute(2).unwrap(), 2);
//! assert!(counter.delete(1).is_err());
//! ```

use bitflags::bitflags;
use std::fmt;

use crate::error::{ResourceError, Result};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Domain operations a resource implements, as a bit field
    pub struct Capabilities: u8 {
        const EXECUTE = 0b00000001;
        const FETCH = 0b00000010;
        const INSERT = 0b00000100;
        const UPDATE = 0b00001000;
        const DELETE = 0b00010000;
    }
}

/// A single domain operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Run a raw command or statement
    Execute,
    /// Read records
    Fetch,
    /// Write new records
    Insert,
    /// Modify existing records
    Update,
    /// Remove records
    Delete,
}

impl Operation {
    /// The capability bit that grants this operation.
    pub fn capability(self) -> Capabilities {
        match self {
            Self::Execute => Capabilities::EXECUTE,
            Self::Fetch => Capabilities::FETCH,
            Self::Insert => Capabilities::INSERT,
            Self::Update => Capabilities::UPDATE,
            Self::Delete => Capabilities::DELETE,
        }
    }

    /// Lowercase name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Fetch => "fetch",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work capacity owned by a pool.
///
/// `open` and `close` are side-effecting and not required to be idempotent;
/// the pool calls `open` exactly once after creation and `close` at most
/// once before dropping the resource.
pub trait Resource: Send + 'static {
    /// Input accepted by the domain operations
    type Request;

    /// Output produced by the domain operations
    type Response;

    /// Establish the underlying session or connection.
    fn open(&mut self) -> Result<()>;

    /// Tear down the underlying session or connection.
    fn close(&mut self) -> Result<()>;

    /// Operations this backend implements. Defaults to none.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Check a single operation against [`Resource::capabilities`].
    fn supports(&self, operation: Operation) -> bool {
        self.capabilities().contains(operation.capability())
    }

    /// Short description used in logs and errors.
    fn describe(&self) -> String {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("resource")
            .to_string()
    }

    /// Run a raw command.
    fn execute(&mut self, request: Self::Request) -> Result<Self::Response> {
        let _ = request;
        Err(not_supported(&*self, Operation::Execute))
    }

    /// Read records.
    fn fetch(&mut self, request: Self::Request) -> Result<Self::Response> {
        let _ = request;
        Err(not_supported(&*self, Operation::Fetch))
    }

    /// Write new records.
    fn insert(&mut self, request: Self::Request) -> Result<Self::Response> {
        let _ = request;
        Err(not_supported(&*self, Operation::Insert))
    }

    /// Modify existing records.
    fn update(&mut self, request: Self::Request) -> Result<Self::Response> {
        let _ = request;
        Err(not_supported(&*self, Operation::Update))
    }

    /// Remove records.
    fn delete(&mut self, request: Self::Request) -> Result<Self::Response> {
        let _ = request;
        Err(not_supported(&*self, Operation::Delete))
    }
}

/// Build the `NotSupported` error for `operation` on `resource`.
pub fn not_supported<R: Resource + ?Sized>(resource: &R, operation: Operation) -> crate::Error {
    ResourceError::NotSupported {
        operation,
        resource: resource.describe(),
    }
    .into()
}
