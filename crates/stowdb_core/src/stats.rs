//! Environment statistics.
//!
//! Counters are relaxed atomics and may be read while operations are in
//! progress. [`EnvironmentStats::snapshot`] copies them, together with the
//! lock manager's counters, into a plain [`StatsSnapshot`].

use crate::lock::LockStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of an environment.
#[derive(Debug, Default)]
pub struct EnvironmentStats {
    transactions_begun: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    records_logged: AtomicU64,
    records_replayed: AtomicU64,
    unknown_resolutions: AtomicU64,
    recovered_aborts: AtomicU64,
}

impl EnvironmentStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_begin(&self) {
        self.transactions_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_logged(&self) {
        self.records_logged.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of the recovery pass run at open.
    pub(crate) fn record_recovery(&self, replayed: u64, unknown: u64, aborted: u64) {
        self.records_replayed.fetch_add(replayed, Ordering::Relaxed);
        self.unknown_resolutions.fetch_add(unknown, Ordering::Relaxed);
        self.recovered_aborts.fetch_add(aborted, Ordering::Relaxed);
    }

    /// Transactions begun since open.
    pub fn transactions_begun(&self) -> u64 {
        self.transactions_begun.load(Ordering::Relaxed)
    }

    /// Transactions committed since open.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Transactions aborted since open.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Log records appended since open.
    pub fn records_logged(&self) -> u64 {
        self.records_logged.load(Ordering::Relaxed)
    }

    /// Returns a snapshot merged with `locks`.
    pub fn snapshot(&self, locks: LockStats) -> StatsSnapshot {
        StatsSnapshot {
            transactions_begun: self.transactions_begun(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            records_logged: self.records_logged(),
            records_replayed: self.records_replayed.load(Ordering::Relaxed),
            unknown_resolutions: self.unknown_resolutions.load(Ordering::Relaxed),
            recovered_aborts: self.recovered_aborts.load(Ordering::Relaxed),
            lock_requests: locks.requests,
            lock_waits: locks.waits,
            lock_timeouts: locks.lock_timeouts,
            txn_timeouts: locks.txn_timeouts,
            deadlocks: locks.deadlocks,
            interrupts: locks.interrupted,
        }
    }
}

/// A point-in-time copy of an environment's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Transactions begun.
    pub transactions_begun: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted, including must-abort ones.
    pub transactions_aborted: u64,
    /// Log records appended.
    pub records_logged: u64,
    /// Log records replayed at open.
    pub records_replayed: u64,
    /// Commit or abort records at open naming a transaction with no work.
    pub unknown_resolutions: u64,
    /// Unresolved transactions aborted at open.
    pub recovered_aborts: u64,
    /// Lock requests.
    pub lock_requests: u64,
    /// Lock requests that waited.
    pub lock_waits: u64,
    /// Lock timeouts.
    pub lock_timeouts: u64,
    /// Transaction timeouts hit during lock waits.
    pub txn_timeouts: u64,
    /// Deadlock victims.
    pub deadlocks: u64,
    /// Lock waits interrupted by cancellation.
    pub interrupts: u64,
}
