//! Deferred tasks and the runners that execute them.
//!
//! A [`Task`] bundles a closure with everything it captured and can run
//! exactly once. A [`Runner`] executes tasks on the calling thread and logs
//! around them; a [`SerializingRunner`] additionally funnels every
//! submission through a FIFO turn so that tasks never overlap.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ferry_core::error::{Error, ExecutionError, Result};
use ferry_core::id::TaskId;
use ferry_core::log_event;
use ferry_core::utils::logging::thread_label;
use ferry_core::utils::LogLevel;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

type TaskFn<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

/// A deferred, single-invocation unit of work.
pub struct Task<T> {
    id: TaskId,
    label: Option<String>,
    body: TaskFn<T>,
}

impl<T> Task<T> {
    /// Create an anonymous task.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self {
            id: TaskId::new(),
            label: None,
            body: Box::new(f),
        }
    }

    /// Create a task with a label shown in logs.
    pub fn labeled<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let mut task = Self::new(f);
        task.label = Some(label.into());
        task
    }

    /// Get the task ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the label, if any
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Invoke the task, consuming it.
    pub fn run(self) -> Result<T> {
        (self.body)()
    }

    /// Invoke the task, turning a panic into `TaskPanicked`.
    pub(crate) fn run_catching(self) -> Result<T> {
        let description = self.to_string();
        match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("{} panicked: {}", description, message);
                Err(ExecutionError::TaskPanicked(format!("{}: {}", description, message)).into())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

impl<T> fmt::Display for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "task {}#{}", label, self.id.short()),
            None => write!(f, "task #{}", self.id.short()),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

/// Runs tasks on the calling thread, logging start and completion.
#[derive(Debug, Clone)]
pub struct Runner {
    name: String,
    debug: bool,
    finished: Arc<AtomicU64>,
}

/// Logs the completion record when dropped, so a panicking task still gets one.
struct Finished<'a> {
    runner: &'a Runner,
    description: String,
    started: Instant,
    outcome: &'static str,
}

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.runner.finished.fetch_add(1, Ordering::SeqCst);
        log_event!(self.runner.verbosity(), "Finished task",
            runner => self.runner.name,
            task => self.description,
            outcome => self.outcome,
            elapsed_ms => self.started.elapsed().as_millis(),
        );
    }
}

impl Runner {
    /// Create a runner. The name is lowercased; an empty name is rejected.
    pub fn new(name: impl Into<String>, debug: bool) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Configuration(
                "Runner name could not be null or empty".to_string(),
            ));
        }

        let runner = Self {
            name: name.to_lowercase(),
            debug,
            finished: Arc::new(AtomicU64::new(0)),
        };
        debug!("Initialized Runner '{}'", runner.name);
        Ok(runner)
    }

    /// Name of this runner.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks that have finished through this runner or its clones, whatever
    /// their outcome.
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    fn verbosity(&self) -> LogLevel {
        LogLevel::verbosity(self.debug)
    }

    /// Run a task and return its result.
    ///
    /// The completion record is logged whether the task succeeds, fails or
    /// panics.
    pub fn run<T>(&self, task: Task<T>) -> Result<T> {
        let mut finished = Finished {
            runner: self,
            description: task.to_string(),
            started: Instant::now(),
            outcome: "panicked",
        };
        log_event!(self.verbosity(), "Started running task",
            runner => self.name,
            task => finished.description,
            thread => thread_label(),
        );

        let result = task.run();
        finished.outcome = if result.is_ok() { "ok" } else { "failed" };
        result
    }
}

/// A runner whose tasks execute one at a time, in submission order.
///
/// Every call to [`SerializingRunner::run`] draws a ticket and waits until
/// that ticket is served, so overlapping submissions are queued FIFO rather
/// than racing for a lock.
#[derive(Debug)]
pub struct SerializingRunner {
    runner: Runner,
    next_ticket: AtomicU64,
    now_serving: Mutex<u64>,
    turn: Condvar,
}

/// Advances the turn when dropped, even if the task panicked.
struct Turn<'a> {
    runner: &'a SerializingRunner,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        *self.runner.now_serving.lock() += 1;
        self.runner.turn.notify_all();
    }
}

impl SerializingRunner {
    /// Create a serializing runner. An empty name is rejected.
    pub fn new(name: impl Into<String>, debug: bool) -> Result<Self> {
        Ok(Self {
            runner: Runner::new(name, debug)?,
            next_ticket: AtomicU64::new(0),
            now_serving: Mutex::new(0),
            turn: Condvar::new(),
        })
    }

    /// Name of this runner.
    pub fn name(&self) -> &str {
        self.runner.name()
    }

    /// Tasks submitted but not yet finished, including the running one.
    pub fn pending(&self) -> u64 {
        let serving = *self.now_serving.lock();
        self.next_ticket.load(Ordering::SeqCst).saturating_sub(serving)
    }

    /// Wait for this submission's turn, then run the task.
    pub fn run<T>(&self, task: Task<T>) -> Result<T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let verbosity = self.runner.verbosity();
        log_event!(verbosity, "Acquiring turn for task",
            runner => self.runner.name,
            task => task,
            ticket => ticket,
        );

        {
            let mut serving = self.now_serving.lock();
            while *serving != ticket {
                self.turn.wait(&mut serving);
            }
        }

        let turn = Turn { runner: self };
        log_event!(verbosity, "Acquired turn for task",
            runner => self.runner.name,
            task => task,
            ticket => ticket,
        );
        let result = self.runner.run(task);
        drop(turn);

        log_event!(verbosity, "Released turn",
            runner => self.runner.name,
            ticket => ticket,
        );
        result
    }

    /// Turn `f` into a function whose every call runs through this runner.
    pub fn wrap<A, T, F>(self: &Arc<Self>, f: F) -> impl Fn(A) -> Result<T> + Send + Sync + 'static
    where
        A: Send + 'static,
        T: 'static,
        F: Fn(A) -> Result<T> + Send + Sync + 'static,
    {
        debug!("Marked function as serialized [runner={}]", self.name());
        let runner = Arc::clone(self);
        let f = Arc::new(f);
        move |arg: A| {
            let f = Arc::clone(&f);
            runner.run(Task::new(move || f(arg)))
        }
    }
}
