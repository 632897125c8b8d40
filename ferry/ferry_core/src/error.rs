//! Error types for the Ferry toolkit.
//!
//! Errors are organised by subsystem: pooling, chained execution and the
//! backend resources themselves. The root `Error` wraps each of them so that
//! task bodies, pools and chains can all share one `Result` type.

use crate::traits::resource::Operation;
use thiserror::Error;

/// Root error type for Ferry.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid constructor arguments or configuration values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Resource pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Execution chain errors
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Errors raised by a pooled resource
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// A task body failed with a plain message
    #[error("Task failed: {0}")]
    Task(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a failed task body.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task(message.into())
    }
}

/// A failure attributed to one named resource of a pool.
#[derive(Debug, Error)]
#[error("{resource}: {source}")]
pub struct ResourceFailure {
    /// Slot name of the resource
    pub resource: String,

    /// What went wrong
    #[source]
    pub source: Box<Error>,
}

/// Errors related to resource pools.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No resource became idle before the claim timeout expired
    #[error("Cannot obtain any resource from pool {pool} within {timeout_ms}ms")]
    ResourceExhausted {
        /// Pool name
        pool: String,
        /// Timeout that expired
        timeout_ms: u64,
    },

    /// The pool has been closed
    #[error("Pool {0} is closed")]
    PoolClosed(String),

    /// Fail-fast initialization aborted construction
    #[error("Pool {pool} failed to initialize: {} of {capacity} resources could not be opened", .failures.len())]
    InitializationFailed {
        /// Pool name
        pool: String,
        /// Requested capacity
        capacity: usize,
        /// Every resource that failed
        failures: Vec<ResourceFailure>,
    },

    /// One or more resources failed to close
    #[error("Pool {pool} closed with {} failure(s)", .failures.len())]
    CloseFailed {
        /// Pool name
        pool: String,
        /// Every resource that failed
        failures: Vec<ResourceFailure>,
    },
}

/// A failed task of a parallel fan-out, keyed by submission index.
#[derive(Debug, Error)]
#[error("task #{index} failed: {source}")]
pub struct TaskFailure {
    /// Submission index of the task
    pub index: usize,

    /// The task's error
    #[source]
    pub source: Box<Error>,
}

/// Errors related to execution chains.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The node has already been executed
    #[error("Task has been already executed")]
    AlreadyExecuted,

    /// A sequential node already carries a task
    #[error("Task already exists")]
    TaskAlreadyExists,

    /// The node carries no task
    #[error("No associated task")]
    NoTask,

    /// One or more tasks of a parallel node failed
    #[error("{} of {total} parallel tasks failed", .failures.len())]
    TasksFailed {
        /// Number of tasks that ran
        total: usize,
        /// Every failure, in submission order
        failures: Vec<TaskFailure>,
    },

    /// A task panicked while running
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

/// Errors related to backend resources.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The backend does not implement the requested operation
    #[error("Operation {operation} is not supported by resource {resource}")]
    NotSupported {
        /// Requested operation
        operation: Operation,
        /// Resource description
        resource: String,
    },

    /// The backend failed underneath
    #[error("Backend failure: {message}")]
    BackendFailure {
        /// Short description of the failing call
        message: String,
        /// Underlying driver error, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ResourceError {
    /// Wrap a driver error as a backend failure.
    pub fn backend<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BackendFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type used throughout Ferry.
pub type Result<T> = std::result::Result<T, Error>;
