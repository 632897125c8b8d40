//! Bounded pooling for backend resources like database connections.
//!
//! A [`ResourcePool`] opens a fixed number of resources up front, hands
//! them out one claim at a time, and takes them back when the
//! [`PooledHandle`] is released or dropped. Every transition between idle
//! and busy happens under the pool lock, and claimants block on a condition
//! variable that is signalled by every release and by `close`.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ferry_core::error::{Error, ExecutionError, PoolError, ResourceFailure, Result};
use ferry_core::id::ClaimId;
use ferry_core::log_event;
use ferry_core::traits::resource::{not_supported, Operation, Resource};
use ferry_core::utils::logging::thread_label;
use ferry_core::utils::{InitPolicy, LogLevel, PoolConfig};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use super::stats::{LogStatsSink, PoolStats, StatsSink};

type Factory<R> = Box<dyn Fn() -> Result<R> + Send + Sync>;

/// A resource position inside the pool. The resource is absent while claimed.
struct Slot<R> {
    name: String,
    resource: Option<R>,
}

impl<R> Slot<R> {
    fn is_busy(&self) -> bool {
        self.resource.is_none()
    }
}

/// Everything guarded by the pool lock.
struct PoolState<R> {
    slots: Vec<Slot<R>>,
    waiting: HashSet<ClaimId>,
    closed: bool,
    generation: u64,
    /// Bumped by every close and restart; a restart installs its resources
    /// only if nothing bumped it since its own close.
    epoch: u64,
}

impl<R> PoolState<R> {
    fn snapshot(&self) -> PoolStats {
        let busy = self.slots.iter().filter(|slot| slot.is_busy()).count();
        PoolStats {
            total: self.slots.len(),
            busy,
            idle: self.slots.len() - busy,
            waiting: self.waiting.len(),
        }
    }

    /// Take the first idle resource, marking its slot busy.
    fn checkout(&mut self) -> Option<(usize, String, R)> {
        self.slots.iter_mut().enumerate().find_map(|(index, slot)| {
            slot.resource
                .take()
                .map(|resource| (index, slot.name.clone(), resource))
        })
    }
}

struct PoolInner<R> {
    config: PoolConfig,
    factory: Factory<R>,
    sink: Arc<dyn StatsSink>,
    state: Mutex<PoolState<R>>,
    /// Signalled on every release and on close
    available: Condvar,
    /// Wakes the stats reporter early on close
    stats_signal: Condvar,
    stats_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Resource> PoolInner<R> {
    fn verbosity(&self) -> LogLevel {
        LogLevel::verbosity(self.config.debug_logging)
    }

    fn closed_error(&self) -> Error {
        PoolError::PoolClosed(self.config.name.clone()).into()
    }

    /// Put a claimed resource back, or close it when its pool generation is gone.
    fn release(&self, slot: usize, generation: u64, name: &str, resource: R) {
        let mut state = self.state.lock();
        if state.closed || state.generation != generation {
            drop(state);
            debug!(
                "Pool {} no longer owns {}, closing it on release",
                self.config.name, name
            );
            let mut resource = resource;
            if let Err(e) = resource.close() {
                error!("Resource {} could not be closed: {}", name, e);
            }
            return;
        }

        match state.slots.get_mut(slot) {
            Some(entry) => entry.resource = Some(resource),
            None => {
                warn!(
                    "Pool {} has no slot {} for {}, dropping it",
                    self.config.name, slot, name
                );
                return;
            }
        }
        drop(state);

        log_event!(self.verbosity(), "Resource released",
            pool => self.config.name,
            resource => name,
            thread => thread_label(),
        );
        self.available.notify_one();
    }

    fn stats_loop(&self, generation: u64) {
        let interval = self.config.stats_interval();
        debug!(
            "Stats reporter started [pool={},interval={}ms]",
            self.config.name, self.config.stats_interval_ms
        );

        loop {
            let snapshot = {
                let mut state = self.state.lock();
                let deadline = Instant::now() + interval;
                while !state.closed && state.generation == generation && Instant::now() < deadline
                {
                    self.stats_signal.wait_until(&mut state, deadline);
                }
                if state.closed || state.generation != generation {
                    break;
                }
                state.snapshot()
            };
            self.sink.record(&self.config.name, &snapshot);
        }

        debug!("Stats reporter stopped [pool={}]", self.config.name);
    }
}

/// Builder for [`ResourcePool`].
pub struct ResourcePoolBuilder<R> {
    config: PoolConfig,
    factory: Option<Factory<R>>,
    sink: Arc<dyn StatsSink>,
}

impl<R: Resource> ResourcePoolBuilder<R> {
    /// Set the zero-argument resource producer.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<R> + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Set where periodic stats go. Defaults to [`LogStatsSink`].
    pub fn stats_sink<S>(mut self, sink: S) -> Self
    where
        S: StatsSink + 'static,
    {
        self.sink = Arc::new(sink);
        self
    }

    /// Validate the settings, open the resources and start the stats reporter.
    pub fn build(self) -> Result<ResourcePool<R>> {
        self.config.validate()?;
        let factory = self.factory.ok_or_else(|| {
            Error::Configuration(format!(
                "Pool {} has no resource factory",
                self.config.name
            ))
        })?;

        let slots = open_resources(&self.config, factory.as_ref())?;

        let pool = ResourcePool {
            inner: Arc::new(PoolInner {
                config: self.config,
                factory,
                sink: self.sink,
                state: Mutex::new(PoolState {
                    slots,
                    waiting: HashSet::new(),
                    closed: false,
                    generation: 0,
                    epoch: 0,
                }),
                available: Condvar::new(),
                stats_signal: Condvar::new(),
                stats_thread: Mutex::new(None),
            }),
        };
        pool.start_stats_reporter(0)?;

        Ok(pool)
    }
}

/// A fixed-capacity pool of reusable resources.
///
/// Share it between threads behind an `Arc`; every operation takes `&self`.
/// Dropping the pool closes it.
pub struct ResourcePool<R: Resource> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Resource> ResourcePool<R> {
    /// Start building a pool with the given settings.
    pub fn builder(config: PoolConfig) -> ResourcePoolBuilder<R> {
        ResourcePoolBuilder {
            config,
            factory: None,
            sink: Arc::new(LogStatsSink),
        }
    }

    /// Create a pool with the default stats sink.
    pub fn new<F>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> Result<R> + Send + Sync + 'static,
    {
        Self::builder(config).factory(factory).build()
    }

    /// Name of the pool.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Requested number of resources.
    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Whether `close` has been called (and no restart followed).
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().snapshot()
    }

    /// Claim with the configured default timeout.
    pub fn claim_default(&self) -> Result<PooledHandle<R>> {
        self.claim(self.inner.config.claim_timeout_ms)
    }

    /// Claim an idle resource, waiting up to `timeout_ms` for one to be
    /// released. A timeout of 0 waits indefinitely.
    ///
    /// Fails with `PoolClosed` when the pool is closed before or during the
    /// wait, and with `ResourceExhausted` when the timeout expires.
    pub fn claim(&self, timeout_ms: u64) -> Result<PooledHandle<R>> {
        let inner = &self.inner;
        let verbosity = inner.verbosity();
        let claim_id = ClaimId::new();
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        log_event!(verbosity, "Waiting to obtain a resource",
            pool => inner.config.name,
            claim => claim_id.short(),
            thread => thread_label(),
            timeout_ms => timeout_ms,
        );

        let mut state = inner.state.lock();
        let outcome = loop {
            if state.closed {
                break Err(inner.closed_error());
            }
            if let Some(found) = state.checkout() {
                break Ok((found, state.generation));
            }

            state.waiting.insert(claim_id);
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break Err(PoolError::ResourceExhausted {
                            pool: inner.config.name.clone(),
                            timeout_ms,
                        }
                        .into());
                    }
                    inner.available.wait_until(&mut state, deadline);
                }
                None => inner.available.wait(&mut state),
            }
        };
        state.waiting.remove(&claim_id);
        drop(state);

        match outcome {
            Ok(((slot, name, resource), generation)) => {
                log_event!(verbosity, "Resource obtained",
                    pool => inner.config.name,
                    resource => name,
                    claim => claim_id.short(),
                    thread => thread_label(),
                );
                Ok(PooledHandle::new(resource, slot, name, generation, &self.inner))
            }
            Err(e) => {
                log_event!(verbosity, "Could not obtain a resource",
                    pool => inner.config.name,
                    claim => claim_id.short(),
                    thread => thread_label(),
                    reason => e,
                );
                Err(e)
            }
        }
    }

    /// Claim an idle resource without waiting.
    pub fn try_claim(&self) -> Result<PooledHandle<R>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(self.inner.closed_error());
        }
        match state.checkout() {
            Some((slot, name, resource)) => {
                let generation = state.generation;
                drop(state);
                Ok(PooledHandle::new(resource, slot, name, generation, &self.inner))
            }
            None => Err(PoolError::ResourceExhausted {
                pool: self.inner.config.name.clone(),
                timeout_ms: 0,
            }
            .into()),
        }
    }

    /// Close the pool.
    ///
    /// Idempotent: only the first call closes anything. Waiting claims fail
    /// with `PoolClosed`, the stats reporter stops, and every idle resource
    /// is closed on its own thread. Resources still claimed are closed by
    /// their handles on release. Individual close failures are logged and
    /// returned together as `CloseFailed`. Closing while a restart is still
    /// opening resources keeps the pool closed.
    pub fn close(&self) -> Result<()> {
        self.shut_down().1
    }

    /// Close the pool, returning the epoch this close was recorded at.
    fn shut_down(&self) -> (u64, Result<()>) {
        let inner = &self.inner;
        let (epoch, resources): (u64, Vec<(String, R)>) = {
            let mut state = inner.state.lock();
            state.epoch += 1;
            let epoch = state.epoch;
            if state.closed {
                drop(state);
                debug!("Pool {} already closed", inner.config.name);
                self.join_stats_reporter();
                return (epoch, Ok(()));
            }
            state.closed = true;
            (epoch, idle_resources(state.slots.drain(..)))
        };
        inner.available.notify_all();
        inner.stats_signal.notify_all();
        self.join_stats_reporter();

        debug!(
            "Closing resources [pool={},total={}]",
            inner.config.name,
            resources.len()
        );
        let total = resources.len();
        let failures = close_resources(resources);
        info!(
            "Resources closed [pool={},total={},failed={}]",
            inner.config.name,
            total,
            failures.len()
        );

        if failures.is_empty() {
            (epoch, Ok(()))
        } else {
            let error = PoolError::CloseFailed {
                pool: inner.config.name.clone(),
                failures,
            };
            (epoch, Err(error.into()))
        }
    }

    /// Close the pool and open a fresh set of resources.
    ///
    /// Not atomic with respect to concurrent claimers: a claim that lands
    /// between the two steps fails with `PoolClosed`, and handles claimed
    /// before the restart close their resource on release instead of
    /// returning it.
    ///
    /// When restarts overlap, only the one that closed the pool last
    /// installs its resources; the others close what they opened and return
    /// `Ok`. A `close` that lands while a restart is opening resources wins
    /// the same way: the pool stays closed and the fresh resources are
    /// closed again.
    pub fn restart(&self) -> Result<()> {
        let inner = &self.inner;
        info!("Restarting pool {}", inner.config.name);
        let (epoch, closed) = self.shut_down();
        if let Err(e) = closed {
            warn!("Pool {} restarting after close failures: {}", inner.config.name, e);
        }

        let slots = open_resources(&inner.config, inner.factory.as_ref())?;
        let generation = {
            let mut state = inner.state.lock();
            if !state.closed || state.epoch != epoch {
                drop(state);
                info!(
                    "Pool {} was closed or restarted meanwhile, discarding {} resources",
                    inner.config.name,
                    slots.len()
                );
                close_resources(idle_resources(slots));
                return Ok(());
            }
            state.slots = slots;
            state.closed = false;
            state.generation += 1;
            state.generation
        };
        self.start_stats_reporter(generation)
    }

    /// Spawn the reporter for `generation`, joining any previous one first.
    fn start_stats_reporter(&self, generation: u64) -> Result<()> {
        self.join_stats_reporter();
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("{}-stats", self.inner.config.name))
            .spawn(move || inner.stats_loop(generation))?;
        let previous = self.inner.stats_thread.lock().replace(handle);
        if let Some(previous) = previous.filter(|h| h.thread().id() != thread::current().id()) {
            if previous.join().is_err() {
                error!("Stats reporter of pool {} panicked", self.inner.config.name);
            }
        }
        Ok(())
    }

    fn join_stats_reporter(&self) {
        let handle = self.inner.stats_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Stats reporter of pool {} panicked", self.inner.config.name);
            }
        }
    }
}

impl<R: Resource> Drop for ResourcePool<R> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Pool {} dropped with close failures: {}", self.inner.config.name, e);
        }
    }
}

impl<R: Resource> fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.config.name)
            .field("capacity", &self.inner.config.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Run `factory` then `open` for every slot, each on its own thread.
fn open_resources<R: Resource>(
    config: &PoolConfig,
    factory: &(dyn Fn() -> Result<R> + Send + Sync),
) -> Result<Vec<Slot<R>>> {
    let verbosity = LogLevel::verbosity(config.debug_logging);
    info!(
        "Opening resources [pool={},total={}]",
        config.name, config.capacity
    );

    let outcomes: Vec<(String, Result<R>)> = thread::scope(|scope| {
        let workers: Vec<_> = (0..config.capacity)
            .map(|index| {
                let name = format!("{}-{}", config.name, index).to_lowercase();
                let worker = thread::Builder::new()
                    .name(format!("{}-init-{}", config.name, index))
                    .spawn_scoped(scope, {
                        let name = name.clone();
                        move || {
                            let mut resource = factory()?;
                            log_event!(verbosity, "Opening resource",
                                resource => name,
                                thread => thread_label(),
                            );
                            resource.open()?;
                            log_event!(verbosity, "Resource opened",
                                resource => name,
                                thread => thread_label(),
                            );
                            Ok(resource)
                        }
                    });
                (name, worker)
            })
            .collect();

        workers
            .into_iter()
            .map(|(name, worker)| {
                let outcome = match worker {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        Err(ExecutionError::TaskPanicked(format!("factory of {}", name)).into())
                    }),
                    Err(e) => Err(Error::Io(e)),
                };
                (name, outcome)
            })
            .collect()
    });

    let mut slots = Vec::with_capacity(config.capacity);
    let mut failures = Vec::new();
    for (name, outcome) in outcomes {
        match outcome {
            Ok(resource) => slots.push(Slot {
                name,
                resource: Some(resource),
            }),
            Err(e) => {
                error!("Resource {} could not be opened: {}", name, e);
                failures.push(ResourceFailure {
                    resource: name,
                    source: Box::new(e),
                });
            }
        }
    }

    if !failures.is_empty() && config.init_policy == InitPolicy::FailFast {
        close_resources(idle_resources(slots));
        return Err(PoolError::InitializationFailed {
            pool: config.name.clone(),
            capacity: config.capacity,
            failures,
        }
        .into());
    }

    if slots.len() < config.capacity {
        warn!(
            "Pool {} degraded to {} of {} resources",
            config.name,
            slots.len(),
            config.capacity
        );
    } else {
        info!(
            "Resources opened [pool={},total={}]",
            config.name,
            slots.len()
        );
    }

    Ok(slots)
}

/// The resources of `slots` that are not claimed, with their names.
fn idle_resources<R>(slots: impl IntoIterator<Item = Slot<R>>) -> Vec<(String, R)> {
    slots
        .into_iter()
        .filter_map(|slot| slot.resource.map(|resource| (slot.name, resource)))
        .collect()
}

/// Close every resource on its own thread, collecting the failures.
fn close_resources<R: Resource>(resources: Vec<(String, R)>) -> Vec<ResourceFailure> {
    thread::scope(|scope| {
        let workers: Vec<_> = resources
            .into_iter()
            .map(|(name, mut resource)| {
                let worker = thread::Builder::new()
                    .name(format!("{}-close", name))
                    .spawn_scoped(scope, {
                        let name = name.clone();
                        move || {
                            debug!("Closing resource {}", name);
                            resource.close()
                        }
                    });
                (name, worker)
            })
            .collect();

        workers
            .into_iter()
            .filter_map(|(name, worker)| {
                let outcome = match worker {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        Err(ExecutionError::TaskPanicked(format!("close of {}", name)).into())
                    }),
                    Err(e) => Err(Error::Io(e)),
                };
                match outcome {
                    Ok(()) => {
                        debug!("Resource {} closed", name);
                        None
                    }
                    Err(e) => {
                        error!("Resource {} could not be closed: {}", name, e);
                        Some(ResourceFailure {
                            resource: name,
                            source: Box::new(e),
                        })
                    }
                }
            })
            .collect()
    })
}

/// Exclusive, temporary access to one pooled resource.
///
/// The handle borrows the resource from its pool and gives it back exactly
/// once, on [`PooledHandle::release`] or when dropped. It dereferences to
/// the resource, and also forwards the domain operations after checking the
/// resource's capabilities.
pub struct PooledHandle<R: Resource> {
    resource: Option<R>,
    slot: usize,
    name: String,
    generation: u64,
    pool: Weak<PoolInner<R>>,
    acquired_at: Instant,
}

impl<R: Resource> PooledHandle<R> {
    fn new(
        resource: R,
        slot: usize,
        name: String,
        generation: u64,
        pool: &Arc<PoolInner<R>>,
    ) -> Self {
        Self {
            resource: Some(resource),
            slot,
            name,
            generation,
            pool: Arc::downgrade(pool),
            acquired_at: Instant::now(),
        }
    }

    /// Slot name of the claimed resource, e.g. `mongo-2`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a reference to the resource
    pub fn get(&self) -> &R {
        self.resource.as_ref().expect("resource already released")
    }

    /// Get a mutable reference to the resource
    pub fn get_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("resource already released")
    }

    /// Time since this resource was claimed
    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Give the resource back to the pool now.
    pub fn release(mut self) {
        self.give_back();
    }

    /// Run a raw command on the resource.
    pub fn execute(&mut self, request: R::Request) -> Result<R::Response> {
        self.forward(Operation::Execute, request, R::execute)
    }

    /// Read records through the resource.
    pub fn fetch(&mut self, request: R::Request) -> Result<R::Response> {
        self.forward(Operation::Fetch, request, R::fetch)
    }

    /// Write new records through the resource.
    pub fn insert(&mut self, request: R::Request) -> Result<R::Response> {
        self.forward(Operation::Insert, request, R::insert)
    }

    /// Modify records through the resource.
    pub fn update(&mut self, request: R::Request) -> Result<R::Response> {
        self.forward(Operation::Update, request, R::update)
    }

    /// Remove records through the resource.
    pub fn delete(&mut self, request: R::Request) -> Result<R::Response> {
        self.forward(Operation::Delete, request, R::delete)
    }

    fn forward(
        &mut self,
        operation: Operation,
        request: R::Request,
        call: fn(&mut R, R::Request) -> Result<R::Response>,
    ) -> Result<R::Response> {
        let resource = self.get_mut();
        if !resource.supports(operation) {
            return Err(not_supported(&*resource, operation));
        }
        call(resource, request)
    }

    fn give_back(&mut self) {
        if let Some(resource) = self.resource.take() {
            match self.pool.upgrade() {
                Some(pool) => pool.release(self.slot, self.generation, &self.name, resource),
                None => {
                    // Pool no longer exists, close the resource
                    let mut resource = resource;
                    if let Err(e) = resource.close() {
                        error!("Resource {} could not be closed: {}", self.name, e);
                    }
                }
            }
        }
    }
}

impl<R: Resource> Deref for PooledHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.get()
    }
}

impl<R: Resource> DerefMut for PooledHandle<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.get_mut()
    }
}

impl<R: Resource> Drop for PooledHandle<R> {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl<R: Resource> fmt::Debug for PooledHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("name", &self.name)
            .field("released", &self.resource.is_none())
            .field("held_for", &self.held_duration())
            .finish()
    }
}
