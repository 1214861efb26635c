//! Environment facade and recovery.

use crate::config::{EnvironmentConfig, IsolationLevel, TxnConfig};
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockGrant, LockManager, LockMode, LockRequest, TimeoutLayers, WaitDeadlines};
use crate::log::{LogEntry, LogManager, LogRecord};
use crate::recovery::{LiveRecordSet, RecoveryEngine, ReplayState};
use crate::stats::{EnvironmentStats, StatsSnapshot};
use crate::sync::{LatencyTracker, OpKind};
use crate::txn::{Transaction, TxnRelease};
use crate::types::{Lsn, ResourceId, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stowdb_storage::{FileStore, LogStore, MemoryStore};

/// The main environment handle.
///
/// An `Environment` owns the log, the lock table and the live record set.
/// Opening one replays the log; transactions the log leaves unresolved are
/// treated as aborted and an abort record is appended for each, so the
/// next open sees them resolved.
///
/// Every record the environment appends is also fed through the same
/// replay state machine that recovery uses. The live set after a restart is
/// therefore the live set before it.
///
/// ```rust
/// use stowdb_core::{Environment, TxnConfig};
///
/// let env = Environment::open_in_memory().unwrap();
/// let mut txn = env.begin(TxnConfig::default()).unwrap();
/// env.put(&mut txn, b"k1", b"v1").unwrap();
/// env.commit(&mut txn).unwrap();
///
/// assert!(env.live_records().contains(b"k1", b"v1"));
/// ```
pub struct Environment {
    config: EnvironmentConfig,
    log: LogManager,
    state: Arc<Mutex<ReplayState>>,
    locks: Arc<LockManager>,
    tracker: LatencyTracker<OpKind>,
    stats: Arc<EnvironmentStats>,
    next_txid: AtomicU64,
    is_open: RwLock<bool>,
}

impl Environment {
    /// Opens an environment over `store`, recovering whatever it holds.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for a bad config, a
    /// corruption error if the log cannot be replayed, or a storage error.
    pub fn open(config: EnvironmentConfig, store: Box<dyn LogStore>) -> CoreResult<Self> {
        config.validate()?;
        let tracker = LatencyTracker::new(config.tracker.clone())?;
        let log = LogManager::open(store)?;

        let started = Instant::now();
        let outcome = RecoveryEngine::new(&log).recover()?;
        let mut state = outcome.state;
        for &txid in &outcome.unresolved {
            let entry = LogEntry::abort(txid);
            let lsn = log.append(&entry)?;
            state.apply(&LogRecord::new(lsn, entry))?;
        }
        if !outcome.unresolved.is_empty() {
            log.sync()?;
            tracing::info!(
                count = outcome.unresolved.len(),
                txids = ?outcome.unresolved,
                "aborted transactions left open in the log"
            );
        }

        let stats = EnvironmentStats::new();
        stats.record_recovery(
            outcome.stats.records,
            outcome.stats.unknown_resolutions,
            outcome.unresolved.len() as u64,
        );
        tracing::info!(
            live = state.live().len(),
            next_txid = %outcome.next_txid,
            elapsed = ?started.elapsed(),
            "environment opened"
        );

        Ok(Self {
            locks: Arc::new(LockManager::new(config.deadlock_detection)),
            config,
            log,
            state: Arc::new(Mutex::new(state)),
            tracker,
            stats: Arc::new(stats),
            next_txid: AtomicU64::new(outcome.next_txid.as_u64()),
            is_open: RwLock::new(true),
        })
    }

    /// Opens a fresh in-memory environment with the default config.
    ///
    /// # Errors
    ///
    /// Fails only if the default config is rejected.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(EnvironmentConfig::default(), Box::new(MemoryStore::new()))
    }

    /// Opens or creates a file-backed environment with the default config.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_path(path: &Path) -> CoreResult<Self> {
        Self::open_path_with_config(path, EnvironmentConfig::default())
    }

    /// Opens or creates a file-backed environment.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_path_with_config(path: &Path, config: EnvironmentConfig) -> CoreResult<Self> {
        let store = FileStore::open(path)?;
        Self::open(config, Box::new(store))
    }

    /// Begins a transaction.
    ///
    /// The transaction's timeouts are the environment's, narrowed by the
    /// overrides in `txn_config`. Dropping the handle while it is still
    /// active aborts it in memory: its locks are released and its pending
    /// work discarded. Its logged writes stay unresolved until the next
    /// open aborts them.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for a bad override.
    pub fn begin(&self, txn_config: TxnConfig) -> CoreResult<Transaction> {
        self.ensure_open()?;
        txn_config.validate()?;
        let timeouts = TimeoutLayers::new(self.config.lock_timeout, self.config.txn_timeout)
            .narrowed(txn_config.lock_timeout, txn_config.txn_timeout);
        let txid = self.allocate_txid();
        self.stats.record_begin();
        tracing::trace!(%txid, isolation = ?txn_config.isolation, "transaction begun");
        let release = TxnRelease {
            locks: Arc::clone(&self.locks),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        };
        Ok(Transaction::new(txid, txn_config.isolation, timeouts).with_release(release))
    }

    /// Runs `f` in a transaction, committing on `Ok` and aborting on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or from commit or abort.
    pub fn transaction<F, T>(&self, txn_config: TxnConfig, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut txn = self.begin(txn_config)?;
        match f(&mut txn) {
            Ok(value) => {
                self.commit(&mut txn)?;
                Ok(value)
            }
            Err(err) => {
                if txn.is_active() {
                    self.abort(&mut txn)?;
                }
                Err(err)
            }
        }
    }

    /// Inserts `value` under `key`. Duplicate pairs are kept.
    ///
    /// # Errors
    ///
    /// Fails if the Write lock cannot be taken or the log append fails. A
    /// transaction timeout or deadlock also marks `txn` must-abort.
    pub fn put(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> CoreResult<Lsn> {
        self.tracker.time(OpKind::Put, || {
            let entry = LogEntry::txn_put(txn.id(), key, value);
            self.write(txn, key, entry)
        })
    }

    /// Deletes `value` under `key`, or the first value under `key` when
    /// `value` is `None`.
    ///
    /// # Errors
    ///
    /// See [`put`](Self::put).
    pub fn delete(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> CoreResult<Lsn> {
        self.tracker.time(OpKind::Delete, || {
            let entry = LogEntry::txn_delete(txn.id(), key, value.map(<[u8]>::to_vec));
            self.write(txn, key, entry)
        })
    }

    /// Values under `key` as `txn` sees them: the committed values with
    /// the transaction's own writes applied.
    ///
    /// Takes a Read lock. Under [`IsolationLevel::ReadCommitted`] a lock
    /// taken for this read is dropped once the values are copied.
    ///
    /// # Errors
    ///
    /// See [`put`](Self::put).
    pub fn get(&self, txn: &mut Transaction, key: &[u8]) -> CoreResult<Vec<Vec<u8>>> {
        self.tracker.time(OpKind::Get, || {
            self.ensure_open()?;
            txn.ensure_usable()?;
            let resource = ResourceId::from(key);
            let grant = self.acquire(txn, &resource, LockMode::Read, None)?;

            let values = {
                let state = self.state.lock();
                let committed = state.live().values(key);
                match state.pending(txn.id()) {
                    Some(pending) => pending.view(key, committed),
                    None => committed.to_vec(),
                }
            };

            if txn.isolation() == IsolationLevel::ReadCommitted && grant.is_new() {
                self.locks.release(txn.id(), &resource);
            }
            Ok(values)
        })
    }

    /// Locks `key` explicitly. `timeout` can only shorten the
    /// transaction's lock timeout; zero, like `None`, keeps it.
    ///
    /// # Errors
    ///
    /// See [`LockManager::acquire`]. A transaction timeout or deadlock also
    /// marks `txn` must-abort.
    pub fn lock(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> CoreResult<LockGrant> {
        self.ensure_open()?;
        txn.ensure_usable()?;
        self.acquire(txn, &ResourceId::from(key), mode, timeout)
    }

    /// Commits `txn`, returning the LSN of its commit record.
    ///
    /// A transaction that logged no writes commits without a record and
    /// returns `None`. The log is synced first when `sync_on_commit` is
    /// set. Locks are released after the commit is logged.
    ///
    /// # Errors
    ///
    /// A must-abort transaction is aborted and
    /// [`CoreError::TransactionMustAbort`] returned. If the commit record
    /// cannot be appended the transaction stays active.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<Option<Lsn>> {
        self.ensure_open()?;
        if let Err(err) = txn.ensure_usable() {
            if matches!(err, CoreError::TransactionMustAbort { .. }) {
                self.abort(txn)?;
            }
            return Err(err);
        }

        self.tracker.time(OpKind::Commit, || {
            let txid = txn.id();
            let lsn = if txn.write_count() > 0 {
                Some(self.append(LogEntry::commit(txid))?)
            } else {
                None
            };
            txn.mark_committed();
            let synced = if self.config.sync_on_commit && lsn.is_some() {
                self.log.sync()
            } else {
                Ok(())
            };
            self.locks.release_all(txid);
            self.stats.record_commit();
            tracing::trace!(%txid, lsn = ?lsn, "transaction committed");
            synced.map(|()| lsn)
        })
    }

    /// Aborts `txn` and releases its locks.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `txn` already resolved,
    /// or a storage error if the abort record cannot be appended. The
    /// transaction is aborted and its locks released either way.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        self.tracker.time(OpKind::Abort, || {
            let txid = txn.id();
            let logged = if txn.write_count() > 0 {
                self.append(LogEntry::abort(txid)).map(drop)
            } else {
                Ok(())
            };
            txn.mark_aborted();
            self.locks.release_all(txid);
            self.stats.record_abort();
            tracing::trace!(%txid, must_abort = ?txn.must_abort(), "transaction aborted");
            logged
        })
    }

    /// Inserts outside any transaction. The key is Write-locked for the
    /// length of the append.
    ///
    /// # Errors
    ///
    /// Fails on a lock timeout or a log failure.
    pub fn put_non_txnal(&self, key: &[u8], value: &[u8]) -> CoreResult<Lsn> {
        self.tracker.time(OpKind::Put, || {
            self.write_non_txnal(key, LogEntry::put(key, value))
        })
    }

    /// Deletes outside any transaction; see [`delete`](Self::delete) for
    /// what `value` selects.
    ///
    /// # Errors
    ///
    /// Fails on a lock timeout or a log failure.
    pub fn delete_non_txnal(&self, key: &[u8], value: Option<&[u8]>) -> CoreResult<Lsn> {
        self.tracker.time(OpKind::Delete, || {
            let entry = match value {
                Some(value) => LogEntry::delete(key, value),
                None => LogEntry::delete_key(key),
            };
            self.write_non_txnal(key, entry)
        })
    }

    /// Copy of the committed record set.
    #[must_use]
    pub fn live_records(&self) -> LiveRecordSet {
        self.state.lock().live().clone()
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.locks.stats())
    }

    /// Operation latency tracker.
    #[must_use]
    pub fn tracker(&self) -> &LatencyTracker<OpKind> {
        &self.tracker
    }

    /// Lock manager.
    #[must_use]
    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// The log.
    #[must_use]
    pub fn log(&self) -> &LogManager {
        &self.log
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Syncs the log and refuses further operations. Open transactions
    /// stay unresolved in the log and are aborted by the next open.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the sync fails.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        self.log.sync()?;
        *is_open = false;
        tracing::debug!(last_lsn = %self.log.last_lsn(), "environment closed");
        Ok(())
    }

    /// Checks if the environment is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation("environment is closed"))
        }
    }

    fn allocate_txid(&self) -> TransactionId {
        TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst))
    }

    /// Appends `entry` and applies it to the runtime state. The state lock
    /// is held across both so records reach the state in LSN order.
    fn append(&self, entry: LogEntry) -> CoreResult<Lsn> {
        let mut state = self.state.lock();
        let lsn = self.log.append(&entry)?;
        state.apply(&LogRecord::new(lsn, entry))?;
        self.stats.record_logged();
        Ok(lsn)
    }

    fn acquire(
        &self,
        txn: &mut Transaction,
        resource: &ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> CoreResult<LockGrant> {
        let request = LockRequest::new(txn.id(), resource, mode)
            .deadlines(txn.deadlines(timeout))
            .cancel(txn.cancel_token());
        let result = self
            .tracker
            .time(OpKind::LockWait, || self.locks.acquire(request));
        if let Err(err) = &result {
            txn.note_error(err);
        }
        result
    }

    fn write(&self, txn: &mut Transaction, key: &[u8], entry: LogEntry) -> CoreResult<Lsn> {
        self.ensure_open()?;
        txn.ensure_usable()?;
        self.acquire(txn, &ResourceId::from(key), LockMode::Write, None)?;
        let lsn = self.append(entry)?;
        txn.record_write();
        Ok(lsn)
    }

    fn write_non_txnal(&self, key: &[u8], entry: LogEntry) -> CoreResult<Lsn> {
        self.ensure_open()?;
        // Lockers share the transaction id space but never reach the log.
        let locker = self.allocate_txid();
        let resource = ResourceId::from(key);
        let now = Instant::now();
        let request = LockRequest::new(locker, &resource, LockMode::Write).deadlines(
            WaitDeadlines::new(now, self.config.lock_timeout, now, None),
        );
        self.tracker
            .time(OpKind::LockWait, || self.locks.acquire(request))?;
        let result = self.append(entry);
        self.locks.release_all(locker);
        result
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("log", &self.log)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}
