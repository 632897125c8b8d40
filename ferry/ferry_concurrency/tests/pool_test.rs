//! Integration tests for the resource pool.
//!
//! These tests exercise the pool from several threads at once: capacity,
//! mutual exclusion, claim timeouts, close and the initialization policies.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use ferry_concurrency::pool::{NoopStatsSink, PoolStats, ResourcePool};
use ferry_core::error::{Error, PoolError, Result};
use ferry_core::traits::resource::{Capabilities, Resource};
use ferry_core::utils::{InitPolicy, PoolConfig};
use parking_lot::Mutex;

/// Counters shared by every resource a test factory creates.
#[derive(Default)]
struct Ledger {
    created: AtomicUsize,
    opened: AtomicUsize,
    closed: Mutex<Vec<usize>>,
}

/// A session that records its lifecycle and detects concurrent use.
struct Session {
    id: usize,
    in_use: AtomicBool,
    fail_open: bool,
    ledger: Arc<Ledger>,
}

impl Resource for Session {
    type Request = Duration;
    type Response = usize;

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(Error::task(format!("session {} refused to open", self.id)));
        }
        self.ledger.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.ledger.closed.lock().push(self.id);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::EXECUTE
    }

    fn execute(&mut self, hold: Duration) -> Result<usize> {
        assert!(
            !self.in_use.swap(true, Ordering::SeqCst),
            "session {} used by two claimants",
            self.id
        );
        thread::sleep(hold);
        self.in_use.store(false, Ordering::SeqCst);
        Ok(self.id)
    }
}

fn session_pool(
    config: PoolConfig,
    failing: &'static [usize],
) -> (Result<ResourcePool<Session>>, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::default());
    let factory_ledger = Arc::clone(&ledger);
    let pool = ResourcePool::builder(config)
        .factory(move || {
            let id = factory_ledger.created.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                id,
                in_use: AtomicBool::new(false),
                fail_open: failing.contains(&id),
                ledger: Arc::clone(&factory_ledger),
            })
        })
        .stats_sink(NoopStatsSink)
        .build();
    (pool, ledger)
}

fn pool_of(capacity: usize) -> (ResourcePool<Session>, Arc<Ledger>) {
    let (pool, ledger) = session_pool(PoolConfig::new("Mongo", capacity), &[]);
    (pool.unwrap(), ledger)
}

/// A one-resource pool whose factory, once `armed`, meets `gate` twice:
/// once on entry and once before returning.
fn gated_pool(
    gate: Arc<Barrier>,
    armed: Arc<AtomicBool>,
) -> (ResourcePool<Session>, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::default());
    let factory_ledger = Arc::clone(&ledger);
    let pool = ResourcePool::builder(PoolConfig::new("gated", 1))
        .factory(move || {
            if armed.load(Ordering::SeqCst) {
                gate.wait();
                gate.wait();
            }
            Ok(Session {
                id: factory_ledger.created.fetch_add(1, Ordering::SeqCst),
                in_use: AtomicBool::new(false),
                fail_open: false,
                ledger: Arc::clone(&factory_ledger),
            })
        })
        .stats_sink(NoopStatsSink)
        .build()
        .unwrap();
    (pool, ledger)
}

#[test_log::test]
fn test_pool_holds_capacity_resources() {
    for capacity in [1, 2, 5, 16] {
        let (pool, ledger) = pool_of(capacity);
        assert_eq!(
            pool.stats(),
            PoolStats {
                total: capacity,
                busy: 0,
                idle: capacity,
                waiting: 0,
            }
        );
        assert_eq!(ledger.opened.load(Ordering::SeqCst), capacity);
    }
}

#[test_log::test]
fn test_release_returns_same_resource() {
    let (pool, _) = pool_of(1);

    let first = pool.claim(100).unwrap();
    let first_id = first.id;
    first.release();

    let second = pool.claim(100).unwrap();
    assert_eq!(second.id, first_id);
    assert_eq!(second.name(), "mongo-0");
}

#[test_log::test]
fn test_mutual_exclusion() {
    for threads in [2, 8, 32] {
        let (pool, _) = pool_of(1);
        let pool = Arc::new(pool);
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut session = pool.claim(0).unwrap();
                    session.execute(Duration::from_millis(1)).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
        assert_eq!(pool.stats().idle, 1);
    }
}

#[test_log::test]
fn test_claim_timeout() {
    let (pool, _) = pool_of(1);
    let _held = pool.claim(100).unwrap();

    let started = Instant::now();
    let result = pool.claim(100);
    let elapsed = started.elapsed();

    assert!(matches!(
        result,
        Err(Error::Pool(PoolError::ResourceExhausted {
            timeout_ms: 100,
            ..
        }))
    ));
    assert!(elapsed >= Duration::from_millis(100), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "returned after {:?}", elapsed);
    assert_eq!(pool.stats().waiting, 0);
}

#[test_log::test]
fn test_close_is_idempotent() {
    let (pool, ledger) = pool_of(3);

    pool.close().unwrap();
    pool.close().unwrap();
    assert!(pool.is_closed());

    let mut closed = ledger.closed.lock().clone();
    closed.sort_unstable();
    assert_eq!(closed, vec![0, 1, 2]);

    assert!(matches!(
        pool.claim(10),
        Err(Error::Pool(PoolError::PoolClosed(_)))
    ));
    drop(pool);
    assert_eq!(ledger.closed.lock().len(), 3);
}

#[test_log::test]
fn test_waiting_claim_sees_close() {
    let (pool, _) = pool_of(1);
    let pool = Arc::new(pool);
    let held = pool.claim(100).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let started = Instant::now();
            let result = pool.claim(0);
            (result.map(|handle| handle.id), started.elapsed())
        })
    };

    while pool.stats().waiting == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    pool.close().unwrap();

    let (result, elapsed) = waiter.join().unwrap();
    assert!(matches!(result, Err(Error::Pool(PoolError::PoolClosed(_)))));
    assert!(elapsed < Duration::from_secs(2));
    drop(held);
}

#[test_log::test]
fn test_degrade_policy_shrinks_pool() {
    let config = PoolConfig::new("mssql", 4);
    let (pool, ledger) = session_pool(config, &[1, 3]);
    let pool = pool.unwrap();

    assert_eq!(pool.capacity(), 4);
    assert_eq!(pool.stats().total, 2);
    assert_eq!(ledger.opened.load(Ordering::SeqCst), 2);
}

#[test_log::test]
fn test_fail_fast_policy_closes_opened_resources() {
    let config = PoolConfig::new("mssql", 3).with_init_policy(InitPolicy::FailFast);
    let (pool, ledger) = session_pool(config, &[2]);

    match pool {
        Err(Error::Pool(PoolError::InitializationFailed {
            capacity, failures, ..
        })) => {
            assert_eq!(capacity, 3);
            assert_eq!(failures.len(), 1);
            assert!(failures[0].resource.starts_with("mssql-"));
        }
        other => panic!("unexpected result: {:?}", other.map(|pool| pool.stats())),
    }

    let mut closed = ledger.closed.lock().clone();
    closed.sort_unstable();
    assert_eq!(closed, vec![0, 1]);
}

#[test_log::test]
fn test_stats_sink_receives_snapshots() {
    let seen: Arc<Mutex<Vec<(String, PoolStats)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);

    let pool = ResourcePool::builder(PoolConfig::new("Reporter", 2).with_stats_interval_ms(20))
        .factory(|| {
            Ok(Session {
                id: 0,
                in_use: AtomicBool::new(false),
                fail_open: false,
                ledger: Arc::new(Ledger::default()),
            })
        })
        .stats_sink(move |pool: &str, stats: &PoolStats| {
            sink_seen.lock().push((pool.to_string(), *stats));
        })
        .build()
        .unwrap();

    let _held = pool.claim(100).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    pool.close().unwrap();

    let records = seen.lock().clone();
    assert!(!records.is_empty());
    assert_eq!(records[0].0, "Reporter");
    assert_eq!(records[0].1.total, 2);

    let count = records.len();
    thread::sleep(Duration::from_millis(60));
    assert_eq!(seen.lock().len(), count, "reporter kept running after close");
}

#[test_log::test]
fn test_claim_after_release_is_prompt() {
    let (pool, _) = pool_of(1);
    let pool = Arc::new(pool);
    let held = pool.claim(100).unwrap();

    let blocked = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let started = Instant::now();
            let result = pool.claim(100);
            (result.is_err(), started.elapsed())
        })
    };
    let (failed, elapsed) = blocked.join().unwrap();
    assert!(failed);
    assert!(elapsed >= Duration::from_millis(100));

    held.release();

    let prompt = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let started = Instant::now();
            let result = pool.claim(100);
            (result.map(|handle| handle.id), started.elapsed())
        })
    };
    let (result, elapsed) = prompt.join().unwrap();
    assert_eq!(result.unwrap(), 0);
    // Generous bound for slow CI schedulers
    assert!(elapsed < Duration::from_millis(50), "claim took {:?}", elapsed);
}

#[test_log::test]
fn test_overlapping_restarts_close_every_resource() {
    let gate = Arc::new(Barrier::new(2));
    let armed = Arc::new(AtomicBool::new(false));
    let (pool, ledger) = gated_pool(Arc::clone(&gate), Arc::clone(&armed));
    let pool = Arc::new(pool);
    armed.store(true, Ordering::SeqCst);

    // Each restart's factory call waits for the other's, so both have
    // closed the pool before either installs its resource
    let restarts: Vec<_> = (0..2)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.restart())
        })
        .collect();
    for restart in restarts {
        restart.join().unwrap().unwrap();
    }

    assert!(!pool.is_closed());
    assert_eq!(pool.stats().total, 1);
    assert_eq!(ledger.opened.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.closed.lock().len(), 2);

    pool.close().unwrap();
    let mut closed = ledger.closed.lock().clone();
    closed.sort_unstable();
    assert_eq!(closed, vec![0, 1, 2]);
}

#[test_log::test]
fn test_close_during_restart_keeps_pool_closed() {
    let gate = Arc::new(Barrier::new(2));
    let armed = Arc::new(AtomicBool::new(false));
    let (pool, ledger) = gated_pool(Arc::clone(&gate), Arc::clone(&armed));
    let pool = Arc::new(pool);
    armed.store(true, Ordering::SeqCst);

    let restart = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.restart())
    };

    gate.wait();
    pool.close().unwrap();
    gate.wait();
    restart.join().unwrap().unwrap();

    assert!(pool.is_closed());
    assert_eq!(pool.stats().total, 0);
    assert!(matches!(
        pool.claim(10),
        Err(Error::Pool(PoolError::PoolClosed(_)))
    ));
    assert_eq!(ledger.opened.load(Ordering::SeqCst), 2);
    let mut closed = ledger.closed.lock().clone();
    closed.sort_unstable();
    assert_eq!(closed, vec![0, 1]);
}
