//! Snapshot coordinator counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the snapshot coordinator.
#[derive(Debug)]
pub struct CoordinatorStats {
    saves_ok: AtomicU64,
    saves_failed: AtomicU64,
    loads_ok: AtomicU64,
    loads_failed: AtomicU64,
    /// Requests handed to the owner-thread scheduler.
    deferred_submitted: AtomicU64,
    /// Deferred requests that actually ran.
    deferred_executed: AtomicU64,
    /// Requests that never reached the engine (allocation or queue failure).
    rejected: AtomicU64,
}

impl CoordinatorStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            saves_ok: AtomicU64::new(0),
            saves_failed: AtomicU64::new(0),
            loads_ok: AtomicU64::new(0),
            loads_failed: AtomicU64::new(0),
            deferred_submitted: AtomicU64::new(0),
            deferred_executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_save(&self, ok: bool) {
        let counter = if ok { &self.saves_ok } else { &self.saves_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self, ok: bool) {
        let counter = if ok { &self.loads_ok } else { &self.loads_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_submitted(&self) {
        self.deferred_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn undo_submitted(&self) {
        self.deferred_submitted.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_executed(&self) {
        self.deferred_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            saves_ok: self.saves_ok.load(Ordering::Relaxed),
            saves_failed: self.saves_failed.load(Ordering::Relaxed),
            loads_ok: self.loads_ok.load(Ordering::Relaxed),
            loads_failed: self.loads_failed.load(Ordering::Relaxed),
            deferred_submitted: self.deferred_submitted.load(Ordering::Relaxed),
            deferred_executed: self.deferred_executed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Reset statistics.
    pub fn reset(&self) {
        self.saves_ok.store(0, Ordering::Relaxed);
        self.saves_failed.store(0, Ordering::Relaxed);
        self.loads_ok.store(0, Ordering::Relaxed);
        self.loads_failed.store(0, Ordering::Relaxed);
        self.deferred_submitted.store(0, Ordering::Relaxed);
        self.deferred_executed.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of coordinator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub saves_ok: u64,
    pub saves_failed: u64,
    pub loads_ok: u64,
    pub loads_failed: u64,
    pub deferred_submitted: u64,
    pub deferred_executed: u64,
    pub rejected: u64,
}

impl StatsSnapshot {
    /// Deferred requests submitted but not yet run (or dropped unrun).
    pub fn deferred_outstanding(&self) -> u64 {
        self.deferred_submitted.saturating_sub(self.deferred_executed)
    }
}
