//! Layered timeouts and the deadlines a lock wait races against.
//!
//! Timeouts are set at three layers: environment, transaction and request.
//! Each inner layer can shorten the value it inherits but never lengthen
//! it, so the effective timeout is the smallest one set. `None` means no
//! bound at that layer, and so does a zero duration.

use std::time::{Duration, Instant};

/// Reads a zero timeout as no bound.
#[must_use]
pub fn bounded(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

/// Narrows `outer` by `inner`.
#[must_use]
pub fn narrow(outer: Option<Duration>, inner: Option<Duration>) -> Option<Duration> {
    match (bounded(outer), bounded(inner)) {
        (Some(o), Some(i)) => Some(o.min(i)),
        (o, None) => o,
        (None, i) => i,
    }
}

/// Lock and transaction timeouts after layering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutLayers {
    lock: Option<Duration>,
    txn: Option<Duration>,
}

impl TimeoutLayers {
    /// Environment-level timeouts.
    #[must_use]
    pub fn new(lock: Option<Duration>, txn: Option<Duration>) -> Self {
        Self {
            lock: bounded(lock),
            txn: bounded(txn),
        }
    }

    /// Applies a transaction's overrides.
    #[must_use]
    pub fn narrowed(self, lock: Option<Duration>, txn: Option<Duration>) -> Self {
        Self {
            lock: narrow(self.lock, lock),
            txn: narrow(self.txn, txn),
        }
    }

    /// Lock timeout for one request, given its own override.
    #[must_use]
    pub fn lock_timeout_for(&self, request: Option<Duration>) -> Option<Duration> {
        narrow(self.lock, request)
    }

    /// Effective lock timeout.
    #[must_use]
    pub const fn lock_timeout(&self) -> Option<Duration> {
        self.lock
    }

    /// Effective transaction timeout.
    #[must_use]
    pub const fn txn_timeout(&self) -> Option<Duration> {
        self.txn
    }
}

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The lock timeout; carries its length.
    Lock(Duration),
    /// The transaction timeout; carries its length.
    Transaction(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn after(start: Instant, limit: Option<Duration>) -> Option<Self> {
        let limit = bounded(limit)?;
        // An unrepresentable instant is as good as no deadline.
        start.checked_add(limit).map(|at| Self { at, limit })
    }
}

/// The two deadlines one lock wait races against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitDeadlines {
    lock: Option<Deadline>,
    txn: Option<Deadline>,
}

impl WaitDeadlines {
    /// Deadlines for a wait starting at `wait_start` by a transaction that
    /// began at `txn_start`.
    #[must_use]
    pub fn new(
        wait_start: Instant,
        lock_timeout: Option<Duration>,
        txn_start: Instant,
        txn_timeout: Option<Duration>,
    ) -> Self {
        Self {
            lock: Deadline::after(wait_start, lock_timeout),
            txn: Deadline::after(txn_start, txn_timeout),
        }
    }

    /// No deadlines at all.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// The earlier of the two deadlines.
    #[must_use]
    pub fn next(&self) -> Option<Instant> {
        match (self.lock, self.txn) {
            (Some(l), Some(t)) => Some(l.at.min(t.at)),
            (Some(d), None) | (None, Some(d)) => Some(d.at),
            (None, None) => None,
        }
    }

    /// The deadline that passed first, if any has passed by `now`.
    ///
    /// When both fall on the same instant the transaction timeout wins.
    #[must_use]
    pub fn expired(&self, now: Instant) -> Option<Expiry> {
        let lock = self.lock.filter(|d| d.at <= now);
        let txn = self.txn.filter(|d| d.at <= now);
        match (lock, txn) {
            (Some(l), Some(t)) if l.at < t.at => Some(Expiry::Lock(l.limit)),
            (_, Some(t)) => Some(Expiry::Transaction(t.limit)),
            (Some(l), None) => Some(Expiry::Lock(l.limit)),
            (None, None) => None,
        }
    }
}
