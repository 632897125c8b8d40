//! Bounded fan-out / fan-in.
//!
//! A [`ParallelExecution`] collects tasks and, when forced, runs them on at
//! most `capacity` scoped worker threads. Workers pull `(index, task)` pairs
//! from a shared queue and push results back keyed by submission index, so
//! the returned values are in submission order whatever the completion
//! order was.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::unbounded;
use ferry_core::error::{Error, ExecutionError, Result, TaskFailure};
use ferry_core::log_event;
use ferry_core::utils::logging::thread_label;
use ferry_core::utils::LogLevel;
use log::{debug, error, warn};
use parking_lot::Mutex;

use super::chain::{ExecutionNode, NodeKind};
use super::task::Task;

struct ParallelState<T> {
    tasks: Vec<Task<T>>,
    executed: bool,
}

/// A node holding any number of tasks that run concurrently.
pub struct ParallelExecution<T> {
    state: Arc<Mutex<ParallelState<T>>>,
    label: Arc<str>,
    capacity: usize,
    debug: bool,
}

impl<T> ParallelExecution<T> {
    /// Create an empty node running on at most `capacity` workers.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::build("parallel", capacity, false)
    }

    /// Create an empty node whose workers are named `<label>-worker-<i>`.
    pub fn labeled(label: impl Into<String>, capacity: usize) -> Result<Self> {
        Self::build(label, capacity, false)
    }

    pub(crate) fn build(label: impl Into<String>, capacity: usize, debug: bool) -> Result<Self> {
        if capacity < 1 {
            return Err(Error::Configuration(
                "Parallel capacity could not be less than 1".to_string(),
            ));
        }
        let label: String = label.into();
        Ok(Self {
            state: Arc::new(Mutex::new(ParallelState {
                tasks: Vec::new(),
                executed: false,
            })),
            label: label.into(),
            capacity,
            debug,
        })
    }

    fn share(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            label: Arc::clone(&self.label),
            capacity: self.capacity,
            debug: self.debug,
        }
    }

    /// A fresh node with the same label, capacity and verbosity.
    fn empty_like<U>(&self) -> ParallelExecution<U> {
        ParallelExecution {
            state: Arc::new(Mutex::new(ParallelState {
                tasks: Vec::new(),
                executed: false,
            })),
            label: Arc::clone(&self.label),
            capacity: self.capacity,
            debug: self.debug,
        }
    }

    /// Maximum number of worker threads.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Whether no task has been added (or all have run).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a task. Fails with `AlreadyExecuted` once the node has run.
    pub fn run<F>(&self, f: F) -> Result<&Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.run_task(Task::new(f))
    }

    /// Append an already built task.
    pub fn run_task(&self, task: Task<T>) -> Result<&Self> {
        let mut state = self.state.lock();
        if state.executed {
            return Err(ExecutionError::AlreadyExecuted.into());
        }
        state.tasks.push(task);
        Ok(self)
    }

    /// Whether the tasks have run.
    pub fn is_executed(&self) -> bool {
        self.state.lock().executed
    }
}

impl<T: Send> ParallelExecution<T> {
    /// Run every task and return the results in submission order.
    ///
    /// Every task runs to completion even when others fail. If any task
    /// failed or panicked the call returns `TasksFailed` with all failures
    /// keyed by submission index.
    pub fn get(&self) -> Result<Vec<T>> {
        let tasks = {
            let mut state = self.state.lock();
            if state.executed {
                return Err(ExecutionError::AlreadyExecuted.into());
            }
            if state.tasks.is_empty() {
                return Err(ExecutionError::NoTask.into());
            }
            state.executed = true;
            std::mem::take(&mut state.tasks)
        };

        let total = tasks.len();
        let workers = self.capacity.min(total);
        let verbosity = LogLevel::verbosity(self.debug);
        log_event!(verbosity, "Executing parallel node",
            node => self.label,
            tasks => total,
            workers => workers,
            thread => thread_label(),
        );

        let started = Instant::now();
        let slots = self.fan_out(tasks, workers);
        let (values, failures) = collect(slots);

        log_event!(verbosity, "Parallel node finished",
            node => self.label,
            tasks => total,
            failed => failures.len(),
            elapsed_ms => started.elapsed().as_millis(),
        );

        if failures.is_empty() {
            Ok(values)
        } else {
            warn!(
                "{} of {} tasks of parallel node {} failed",
                failures.len(),
                total,
                self.label
            );
            Err(ExecutionError::TasksFailed { total, failures }.into())
        }
    }

    /// Run the tasks, discarding their values.
    pub fn execute(&self) -> Result<()> {
        self.get().map(|_| ())
    }

    /// Run `tasks` on `workers` scoped threads; one result slot per task.
    fn fan_out(&self, tasks: Vec<Task<T>>, workers: usize) -> Vec<Option<Result<T>>> {
        let mut slots: Vec<Option<Result<T>>> = (0..tasks.len()).map(|_| None).collect();

        let (task_tx, task_rx) = unbounded::<(usize, Task<T>)>();
        let (result_tx, result_rx) = unbounded::<(usize, Result<T>)>();
        for job in tasks.into_iter().enumerate() {
            if task_tx.send(job).is_err() {
                break;
            }
        }
        drop(task_tx);

        thread::scope(|scope| {
            for worker in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-worker-{}", self.label, worker))
                    .spawn_scoped(scope, move || {
                        debug!("Worker {}: Starting", worker);
                        for (index, task) in task_rx.iter() {
                            let outcome = task.run_catching();
                            if result_tx.send((index, outcome)).is_err() {
                                break;
                            }
                        }
                        debug!("Worker {}: Shutting down", worker);
                    });
                if let Err(e) = spawned {
                    error!(
                        "Parallel node {} could not spawn worker {}: {}",
                        self.label, worker, e
                    );
                }
            }
            drop(result_tx);

            for (index, outcome) in result_rx.iter() {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(outcome);
                }
            }
        });

        slots
    }
}

/// Split result slots into values and indexed failures.
fn collect<T>(slots: Vec<Option<Result<T>>>) -> (Vec<T>, Vec<TaskFailure>) {
    let mut values = Vec::with_capacity(slots.len());
    let mut failures = Vec::new();
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(Ok(value)) => values.push(value),
            Some(Err(e)) => failures.push(TaskFailure {
                index,
                source: Box::new(e),
            }),
            None => failures.push(TaskFailure {
                index,
                source: Box::new(
                    ExecutionError::TaskPanicked(format!("task #{} produced no result", index))
                        .into(),
                ),
            }),
        }
    }
    (values, failures)
}

impl<T: Send + 'static> ParallelExecution<T> {
    /// Chain `f` after this node.
    ///
    /// The returned node has the same capacity; its first task forces this
    /// node and hands `f` the ordered results. More tasks can be added to it
    /// with `run` and they run alongside that first task: the continuation is
    /// just the first member of the next fan-out, so only it waits for this
    /// node.
    #[must_use = "the continuation runs only when it is executed"]
    pub fn then<U, F>(&self, f: F) -> ParallelExecution<U>
    where
        U: 'static,
        F: FnOnce(Vec<T>) -> Result<U> + Send + 'static,
    {
        let predecessor = self.share();
        let next = self.empty_like();
        next.state.lock().tasks.push(Task::labeled(
            format!("{}-then", self.label),
            move || f(predecessor.get()?),
        ));
        next
    }

    /// Treat this node as side-effect only; the continuation yields `()`.
    /// This node itself is left unchanged.
    #[must_use = "this node is unchanged; chain on the returned continuation"]
    pub fn ignore_result(&self) -> ParallelExecution<()> {
        self.then(|_| Ok(()))
    }
}

impl<T: Send> ExecutionNode for ParallelExecution<T> {
    type Output = Vec<T>;

    fn get(&self) -> Result<Vec<T>> {
        ParallelExecution::get(self)
    }

    fn is_executed(&self) -> bool {
        ParallelExecution::is_executed(self)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Parallel {
            capacity: self.capacity,
        }
    }
}

impl<T> fmt::Debug for ParallelExecution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ParallelExecution")
            .field("label", &self.label)
            .field("capacity", &self.capacity)
            .field("tasks", &state.tasks.len())
            .field("executed", &state.executed)
            .finish()
    }
}
