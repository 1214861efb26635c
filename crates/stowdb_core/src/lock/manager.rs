//! Resource lock table.

use crate::error::{CoreError, CoreResult};
use crate::lock::deadlock::WaitForGraph;
use crate::lock::mode::LockMode;
use crate::lock::timeout::{Expiry, WaitDeadlines};
use crate::sync::CancelToken;
use crate::types::{ResourceId, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a lock request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// An equal or stronger lock was already held; nothing changed.
    AlreadyHeld,
    /// Granted without waiting.
    Granted,
    /// Granted after blocking for the given time.
    GrantedAfterWait(Duration),
}

impl LockGrant {
    /// Whether this request added or upgraded a lock.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        !matches!(self, Self::AlreadyHeld)
    }
}

/// A lock request.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest<'a> {
    /// Requesting transaction or locker.
    pub txid: TransactionId,
    /// Resource to lock.
    pub resource: &'a ResourceId,
    /// Requested mode.
    pub mode: LockMode,
    /// Deadlines the wait races against.
    pub deadlines: WaitDeadlines,
    /// Token that interrupts the wait.
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> LockRequest<'a> {
    /// A request with no deadlines and no cancel token.
    #[must_use]
    pub fn new(txid: TransactionId, resource: &'a ResourceId, mode: LockMode) -> Self {
        Self {
            txid,
            resource,
            mode,
            deadlines: WaitDeadlines::unbounded(),
            cancel: None,
        }
    }

    /// Sets the deadlines.
    #[must_use]
    pub fn deadlines(mut self, deadlines: WaitDeadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    /// Sets the cancel token.
    #[must_use]
    pub fn cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Snapshot of lock manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Requests made.
    pub requests: u64,
    /// Requests that had to wait.
    pub waits: u64,
    /// Lock timeouts.
    pub lock_timeouts: u64,
    /// Transaction timeouts hit while waiting.
    pub txn_timeouts: u64,
    /// Deadlock victims.
    pub deadlocks: u64,
    /// Waits interrupted by a cancel token.
    pub interrupted: u64,
}

#[derive(Default)]
struct LockCounters {
    requests: AtomicU64,
    waits: AtomicU64,
    lock_timeouts: AtomicU64,
    txn_timeouts: AtomicU64,
    deadlocks: AtomicU64,
    interrupted: AtomicU64,
}

impl LockCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LockStats {
        LockStats {
            requests: self.requests.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            txn_timeouts: self.txn_timeouts.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    txid: TransactionId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct ResourceLock {
    holders: BTreeMap<TransactionId, LockMode>,
    queue: VecDeque<Waiter>,
}

impl ResourceLock {
    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    fn conflicting_holders(&self, txid: TransactionId, mode: LockMode) -> BTreeSet<TransactionId> {
        self.holders
            .iter()
            .filter(|&(&holder, &held)| holder != txid && !held.compatible_with(mode))
            .map(|(&holder, _)| holder)
            .collect()
    }

    /// Transactions `txid` is blocked behind: conflicting holders, plus
    /// conflicting waiters queued ahead of it.
    fn blockers(&self, txid: TransactionId, mode: LockMode) -> BTreeSet<TransactionId> {
        let mut blockers = self.conflicting_holders(txid, mode);
        for waiter in &self.queue {
            if waiter.txid == txid {
                break;
            }
            if !waiter.mode.compatible_with(mode) {
                blockers.insert(waiter.txid);
            }
        }
        blockers
    }

    /// Whether `txid` can take `mode` now. Upgrades only need the other
    /// holders to be compatible; fresh requests also wait their turn.
    fn grantable(&self, txid: TransactionId, mode: LockMode) -> bool {
        if !self.conflicting_holders(txid, mode).is_empty() {
            return false;
        }
        if self.holders.contains_key(&txid) {
            return true;
        }
        self.queue
            .iter()
            .take_while(|w| w.txid != txid)
            .all(|w| w.mode.compatible_with(mode))
    }

    fn dequeue(&mut self, txid: TransactionId) {
        self.queue.retain(|w| w.txid != txid);
    }
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<ResourceId, ResourceLock>,
    held: HashMap<TransactionId, BTreeSet<ResourceId>>,
    graph: WaitForGraph,
    victims: HashMap<TransactionId, Vec<TransactionId>>,
}

impl LockTable {
    fn grant(&mut self, txid: TransactionId, resource: &ResourceId, mode: LockMode) {
        let lock = self.resources.entry(resource.clone()).or_default();
        lock.dequeue(txid);
        let held = lock.holders.entry(txid).or_insert(mode);
        *held = (*held).max(mode);
        self.held.entry(txid).or_default().insert(resource.clone());
        self.graph.clear_waits(txid);
    }

    fn abandon_wait(&mut self, txid: TransactionId, resource: &ResourceId) {
        if let Some(lock) = self.resources.get_mut(resource) {
            lock.dequeue(txid);
            if lock.is_idle() {
                self.resources.remove(resource);
            }
        }
        self.graph.clear_waits(txid);
        self.victims.remove(&txid);
    }

    fn release(&mut self, txid: TransactionId, resource: &ResourceId) -> bool {
        let Some(lock) = self.resources.get_mut(resource) else {
            return false;
        };
        let released = lock.holders.remove(&txid).is_some();
        if lock.is_idle() {
            self.resources.remove(resource);
        }
        if let Some(held) = self.held.get_mut(&txid) {
            held.remove(resource);
            if held.is_empty() {
                self.held.remove(&txid);
            }
        }
        released
    }
}

struct LockShared {
    table: Mutex<LockTable>,
    released: Condvar,
    counters: LockCounters,
}

/// Grants Read and Write locks on resources to transactions.
///
/// Requests that conflict queue in FIFO order. A transaction asking for a
/// mode it already holds, or a weaker one, is satisfied at once. A Read
/// holder asking for Write is upgraded as soon as it is the only holder.
///
/// A blocked request fails when its lock timeout expires
/// ([`CoreError::LockTimeout`]), when its transaction timeout expires
/// ([`CoreError::TransactionTimeout`]), when its cancel token fires
/// ([`CoreError::Interrupted`]), or when it is picked as a deadlock victim
/// ([`CoreError::Deadlock`]). A failed request leaves no trace in the
/// table.
pub struct LockManager {
    shared: Arc<LockShared>,
    deadlock_detection: bool,
}

impl LockManager {
    /// Creates a lock manager.
    #[must_use]
    pub fn new(deadlock_detection: bool) -> Self {
        Self {
            shared: Arc::new(LockShared {
                table: Mutex::new(LockTable::default()),
                released: Condvar::new(),
                counters: LockCounters::default(),
            }),
            deadlock_detection,
        }
    }

    /// Acquires a lock, blocking while it conflicts.
    ///
    /// # Errors
    ///
    /// See the type-level docs for the ways a wait can fail.
    pub fn acquire(&self, request: LockRequest<'_>) -> CoreResult<LockGrant> {
        let LockRequest {
            txid,
            resource,
            mode,
            deadlines,
            cancel,
        } = request;
        let counters = &self.shared.counters;
        LockCounters::bump(&counters.requests);

        let _registration = cancel.map(|token| {
            let shared = Arc::clone(&self.shared);
            token.register(move || {
                let _table = shared.table.lock();
                shared.released.notify_all();
            })
        });

        let started = Instant::now();
        let mut table = self.shared.table.lock();

        if let Some(&held) = table
            .resources
            .get(resource)
            .and_then(|lock| lock.holders.get(&txid))
        {
            if held.covers(mode) {
                return Ok(LockGrant::AlreadyHeld);
            }
        }

        let mut queued = false;
        loop {
            if let Some(cycle) = table.victims.remove(&txid) {
                table.abandon_wait(txid, resource);
                self.shared.released.notify_all();
                LockCounters::bump(&counters.deadlocks);
                tracing::debug!(%txid, %resource, ?cycle, "deadlock victim");
                return Err(CoreError::Deadlock { txid, cycle });
            }

            let now = Instant::now();
            let expiry = deadlines.expired(now);
            let lock = table.resources.entry(resource.clone()).or_default();
            if !matches!(expiry, Some(Expiry::Transaction(_))) && lock.grantable(txid, mode) {
                table.grant(txid, resource, mode);
                if queued {
                    self.shared.released.notify_all();
                    return Ok(LockGrant::GrantedAfterWait(now.duration_since(started)));
                }
                return Ok(LockGrant::Granted);
            }

            let failure = if cancel.is_some_and(CancelToken::is_cancelled) {
                LockCounters::bump(&counters.interrupted);
                Some(CoreError::Interrupted)
            } else {
                match expiry {
                    Some(Expiry::Lock(waited)) => {
                        LockCounters::bump(&counters.lock_timeouts);
                        Some(CoreError::LockTimeout {
                            txid,
                            resource: resource.clone(),
                            waited,
                        })
                    }
                    Some(Expiry::Transaction(limit)) => {
                        LockCounters::bump(&counters.txn_timeouts);
                        Some(CoreError::TransactionTimeout { txid, limit })
                    }
                    None => None,
                }
            };
            if let Some(err) = failure {
                table.abandon_wait(txid, resource);
                if queued {
                    self.shared.released.notify_all();
                }
                tracing::debug!(%txid, %resource, %mode, error = %err, "lock wait failed");
                return Err(err);
            }

            if !queued {
                let waiter = Waiter { txid, mode };
                if lock.holders.contains_key(&txid) {
                    lock.queue.push_front(waiter);
                } else {
                    lock.queue.push_back(waiter);
                }
                queued = true;
                LockCounters::bump(&counters.waits);
            }

            let blockers = lock.blockers(txid, mode);
            table.graph.set_waits(txid, blockers);
            if self.deadlock_detection {
                self.resolve_deadlock(&mut table, txid);
                if table.victims.contains_key(&txid) {
                    continue;
                }
            }

            match deadlines.next() {
                Some(deadline) => {
                    self.shared.released.wait_until(&mut table, deadline);
                }
                None => self.shared.released.wait(&mut table),
            }
        }
    }

    fn resolve_deadlock(&self, table: &mut LockTable, txid: TransactionId) {
        let Some(cycle) = table.graph.cycle_through(txid) else {
            return;
        };
        let Some(victim) = WaitForGraph::choose_victim(&cycle) else {
            return;
        };
        tracing::info!(%victim, ?cycle, "deadlock detected");
        table.graph.clear_waits(victim);
        table.victims.insert(victim, cycle);
        if victim != txid {
            self.shared.released.notify_all();
        }
    }

    /// Releases one lock. Returns whether `txid` held it.
    pub fn release(&self, txid: TransactionId, resource: &ResourceId) -> bool {
        let released = self.shared.table.lock().release(txid, resource);
        if released {
            self.shared.released.notify_all();
        }
        released
    }

    /// Releases every lock `txid` holds and forgets it. Returns the number
    /// of locks released.
    pub fn release_all(&self, txid: TransactionId) -> usize {
        let mut table = self.shared.table.lock();
        let resources = table.held.remove(&txid).unwrap_or_default();
        for resource in &resources {
            if let Some(lock) = table.resources.get_mut(resource) {
                lock.holders.remove(&txid);
                if lock.is_idle() {
                    table.resources.remove(resource);
                }
            }
        }
        table.graph.remove_txn(txid);
        table.victims.remove(&txid);
        drop(table);
        self.shared.released.notify_all();
        resources.len()
    }

    /// Current holders of `resource`.
    #[must_use]
    pub fn holders(&self, resource: &ResourceId) -> Vec<(TransactionId, LockMode)> {
        self.shared
            .table
            .lock()
            .resources
            .get(resource)
            .map(|lock| lock.holders.iter().map(|(t, m)| (*t, *m)).collect())
            .unwrap_or_default()
    }

    /// Requests queued on `resource`.
    #[must_use]
    pub fn waiting(&self, resource: &ResourceId) -> usize {
        self.shared
            .table
            .lock()
            .resources
            .get(resource)
            .map_or(0, |lock| lock.queue.len())
    }

    /// Number of locks `txid` holds.
    #[must_use]
    pub fn locks_held(&self, txid: TransactionId) -> usize {
        self.shared.table.lock().held.get(&txid).map_or(0, BTreeSet::len)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> LockStats {
        self.shared.counters.snapshot()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("deadlock_detection", &self.deadlock_detection)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
