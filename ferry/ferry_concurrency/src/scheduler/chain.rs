//! Lazy, single-use execution chains.
//!
//! A chain is built from nodes. Each node holds deferred work and runs it
//! at most once, when [`ExecutionNode::get`] or [`ExecutionNode::execute`]
//! is called on it or on a node chained after it. Nodes are created through
//! a [`ChainFactory`] or by calling `then` on an existing node:
//!
//! ```
//! use ferry_concurrency::scheduler::ChainFactory;
//!
//! let chain = ChainFactory::default();
//! let total = chain
//!     .run_later(|| Ok(vec![3u32, 4, 5]))
//!     .then(|numbers| Ok(numbers.iter().sum::<u32>()))
//!     .then(|sum| Ok(sum * 2))
//!     .get()
//!     .unwrap();
//! assert_eq!(total, 24);
//! ```

use std::fmt;
use std::sync::Arc;

use ferry_core::error::{ExecutionError, Result};
use ferry_core::log_event;
use ferry_core::utils::logging::thread_label;
use ferry_core::utils::{ExecutionConfig, LogLevel};
use parking_lot::Mutex;

use super::parallel::ParallelExecution;
use super::task::Task;

/// Discriminates the node implementations behind [`ExecutionNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs a single task on the calling thread
    Sequential,

    /// Runs its tasks on at most `capacity` worker threads
    Parallel {
        /// Worker cap
        capacity: usize,
    },
}

/// Common interface of chain nodes.
pub trait ExecutionNode: Send + Sync {
    /// Value produced by the node
    type Output;

    /// Run the node's work and return its result. Fails with
    /// `AlreadyExecuted` on the second call and with `NoTask` when the node
    /// carries no work.
    fn get(&self) -> Result<Self::Output>;

    /// Run the node's work, discarding the value.
    fn execute(&self) -> Result<()> {
        self.get().map(|_| ())
    }

    /// Whether the node has been executed.
    fn is_executed(&self) -> bool;

    /// Which kind of node this is.
    fn kind(&self) -> NodeKind;
}

struct SequentialState<T> {
    task: Option<Task<T>>,
    executed: bool,
}

/// A node holding one deferred task.
pub struct SequentialExecution<T> {
    state: Arc<Mutex<SequentialState<T>>>,
    debug: bool,
}

impl<T> SequentialExecution<T> {
    /// Create an empty node.
    pub fn new() -> Self {
        Self::with_debug(false)
    }

    pub(crate) fn with_debug(debug: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(SequentialState {
                task: None,
                executed: false,
            })),
            debug,
        }
    }

    /// Another handle on the same node.
    fn share(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            debug: self.debug,
        }
    }

    /// Attach the deferred work.
    ///
    /// A node carries one task: a second call fails with
    /// `TaskAlreadyExists`, and a call after execution with
    /// `AlreadyExecuted`.
    pub fn run<F>(&self, f: F) -> Result<&Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.run_task(Task::new(f))
    }

    /// Attach an already built task.
    pub fn run_task(&self, task: Task<T>) -> Result<&Self> {
        let mut state = self.state.lock();
        if state.executed {
            return Err(ExecutionError::AlreadyExecuted.into());
        }
        if state.task.is_some() {
            return Err(ExecutionError::TaskAlreadyExists.into());
        }
        state.task = Some(task);
        Ok(self)
    }

    /// Run the task synchronously and return its result.
    pub fn get(&self) -> Result<T> {
        let task = {
            let mut state = self.state.lock();
            if state.executed {
                return Err(ExecutionError::AlreadyExecuted.into());
            }
            let task = state.task.take().ok_or(ExecutionError::NoTask)?;
            state.executed = true;
            task
        };

        log_event!(LogLevel::verbosity(self.debug), "Executing sequential node",
            task => task,
            thread => thread_label(),
        );
        task.run()
    }

    /// Run the task, discarding its value.
    pub fn execute(&self) -> Result<()> {
        self.get().map(|_| ())
    }

    /// Whether the task has run.
    pub fn is_executed(&self) -> bool {
        self.state.lock().executed
    }

    /// Chain `f` after this node. `f` receives this node's result.
    #[must_use = "the continuation runs only when it is executed"]
    pub fn then<U, F>(&self, f: F) -> SequentialExecution<U>
    where
        T: 'static,
        U: 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let predecessor = self.share();
        let next = SequentialExecution::with_debug(self.debug);
        next.state.lock().task = Some(Task::labeled("then", move || f(predecessor.get()?)));
        next
    }

    /// Treat this node as side-effect only.
    ///
    /// The returned continuation runs this node and yields `()`, so a
    /// `then` chained after it receives none of this node's value. This node
    /// itself is left unchanged.
    #[must_use = "this node is unchanged; chain on the returned continuation"]
    pub fn ignore_result(&self) -> SequentialExecution<()>
    where
        T: 'static,
    {
        self.then(|_| Ok(()))
    }
}

impl<T> Default for SequentialExecution<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ExecutionNode for SequentialExecution<T> {
    type Output = T;

    fn get(&self) -> Result<T> {
        SequentialExecution::get(self)
    }

    fn is_executed(&self) -> bool {
        SequentialExecution::is_executed(self)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Sequential
    }
}

impl<T> fmt::Debug for SequentialExecution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SequentialExecution")
            .field("has_task", &state.task.is_some())
            .field("executed", &state.executed)
            .finish()
    }
}

/// Entry point for building chains.
#[derive(Debug, Clone, Default)]
pub struct ChainFactory {
    config: ExecutionConfig,
}

impl ChainFactory {
    /// Create a factory with the given defaults.
    pub fn new(config: ExecutionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Defaults used by this factory.
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// A sequential node carrying `f`.
    pub fn run_later<T, F>(&self, f: F) -> SequentialExecution<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let node = SequentialExecution::with_debug(self.config.debug_logging);
        node.state.lock().task = Some(Task::new(f));
        node
    }

    /// An empty parallel node running on at most `capacity` workers.
    pub fn parallel<T>(&self, capacity: usize) -> Result<ParallelExecution<T>> {
        ParallelExecution::build("parallel", capacity, self.config.debug_logging)
    }

    /// An empty parallel node using the configured default parallelism.
    pub fn parallel_default<T>(&self) -> Result<ParallelExecution<T>> {
        self.parallel(self.config.default_parallelism)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_twice() {
        let node = ChainFactory::default().run_later(|| Ok(1));
        assert!(!node.is_executed());
        assert_eq!(node.get().unwrap(), 1);
        assert!(node.is_executed());
        assert!(matches!(
            node.get(),
            Err(Error::Execution(ExecutionError::AlreadyExecuted))
        ));
    }

    #[test]
    fn test_run_rules() {
        let node = SequentialExecution::new();
        assert!(matches!(
            node.get(),
            Err(Error::Execution(ExecutionError::NoTask))
        ));

        node.run(|| Ok("first")).unwrap();
        assert!(matches!(
            node.run(|| Ok("second")),
            Err(Error::Execution(ExecutionError::TaskAlreadyExists))
        ));

        assert_eq!(node.get().unwrap(), "first");
        assert!(matches!(
            node.run(|| Ok("third")),
            Err(Error::Execution(ExecutionError::AlreadyExecuted))
        ));
    }

    #[test]
    fn test_then_receives_result() {
        let node = ChainFactory::default()
            .run_later(|| Ok("bikes".to_string()))
            .then(|name| Ok(name.len()));
        assert_eq!(node.kind(), NodeKind::Sequential);
        assert_eq!(node.get().unwrap(), 5);
    }

    #[test]
    fn test_then_runs_predecessor_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let first = ChainFactory::default().run_later(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });
        let second = first.then(|value| Ok(value + 1));

        assert_eq!(second.get().unwrap(), 4);
        assert!(first.is_executed());
        assert!(matches!(
            first.get(),
            Err(Error::Execution(ExecutionError::AlreadyExecuted))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ignore_result() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let node = ChainFactory::default()
            .run_later(|| Ok(99usize))
            .ignore_result()
            .then(move |()| {
                seen_clone.store(1, Ordering::SeqCst);
                Ok("after")
            });
        assert_eq!(node.get().unwrap(), "after");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ignore_result_leaves_node_unchanged() {
        let node = ChainFactory::default().run_later(|| Ok(7u32));
        let _ = node.ignore_result();
        assert!(!node.is_executed());

        let doubled = node.then(|value| Ok(value * 2));
        assert_eq!(doubled.get().unwrap(), 14);
    }

    #[test]
    fn test_failure_propagates_down_the_chain() {
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_clone = Arc::clone(&reached);

        let node = ChainFactory::default()
            .run_later(|| -> Result<u32> { Err(Error::task("fetch failed")) })
            .then(move |value| {
                reached_clone.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            });
        assert!(matches!(node.execute(), Err(Error::Task(_))));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_factory_validates_config() {
        let config = ExecutionConfig {
            default_parallelism: 0,
            debug_logging: false,
        };
        assert!(matches!(
            ChainFactory::new(config),
            Err(Error::Configuration(_))
        ));

        let node = ChainFactory::default().parallel_default::<u8>().unwrap();
        assert_eq!(node.capacity(), 10);
    }
}
