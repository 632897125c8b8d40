//! Pool statistics and the sinks that receive them.

use std::fmt;

use ferry_core::log_event;
use ferry_core::utils::LogLevel;

/// Snapshot of a pool's occupancy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Resources owned by the pool
    pub total: usize,

    /// Resources currently claimed
    pub busy: usize,

    /// Resources ready to be claimed
    pub idle: usize,

    /// Claims currently blocked waiting for a resource
    pub waiting: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[total={},busy={},idle={},waiting={}]",
            self.total, self.busy, self.idle, self.waiting
        )
    }
}

/// Receiver of the periodic stats record of a pool.
///
/// Called from the pool's stats thread, never while the pool lock is held.
pub trait StatsSink: Send + Sync {
    /// Record one snapshot of the named pool.
    fn record(&self, pool: &str, stats: &PoolStats);
}

impl<F> StatsSink for F
where
    F: Fn(&str, &PoolStats) + Send + Sync,
{
    fn record(&self, pool: &str, stats: &PoolStats) {
        self(pool, stats)
    }
}

/// Writes every snapshot to the log at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn record(&self, pool: &str, stats: &PoolStats) {
        log_event!(LogLevel::Info, "Pool stats",
            pool => pool,
            total => stats.total,
            busy => stats.busy,
            idle => stats.idle,
            waiting => stats.waiting,
        );
    }
}

/// Discards every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatsSink;

impl StatsSink for NoopStatsSink {
    fn record(&self, _pool: &str, _stats: &PoolStats) {}
}
