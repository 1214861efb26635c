//! Transaction state.

use crate::config::IsolationLevel;
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockManager, TimeoutLayers, WaitDeadlines};
use crate::recovery::ReplayState;
use crate::stats::EnvironmentStats;
use crate::sync::CancelToken;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// Environment state a transaction cleans up if dropped unresolved.
#[derive(Clone)]
pub(crate) struct TxnRelease {
    pub(crate) locks: Arc<LockManager>,
    pub(crate) state: Arc<Mutex<ReplayState>>,
    pub(crate) stats: Arc<EnvironmentStats>,
}

impl std::fmt::Debug for TxnRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnRelease").finish_non_exhaustive()
    }
}

/// An open transaction.
///
/// Writes are logged as they happen and become visible to other
/// transactions when the commit record is appended. Locks are held until
/// the transaction resolves. Dropping an active transaction releases its
/// locks and discards its pending work; no abort record is written, so
/// recovery aborts it on the next open.
///
/// A transaction that hits its transaction timeout or is picked as a
/// deadlock victim is marked must-abort. From then on every operation
/// other than abort fails with [`CoreError::TransactionMustAbort`].
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TxnState,
    isolation: IsolationLevel,
    started: Instant,
    timeouts: TimeoutLayers,
    must_abort: Option<String>,
    cancel: CancelToken,
    writes: usize,
    release: Option<TxnRelease>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, isolation: IsolationLevel, timeouts: TimeoutLayers) -> Self {
        Self {
            id,
            state: TxnState::Active,
            isolation,
            started: Instant::now(),
            timeouts,
            must_abort: None,
            cancel: CancelToken::new(),
            writes: 0,
            release: None,
        }
    }

    pub(crate) fn with_release(mut self, release: TxnRelease) -> Self {
        self.release = Some(release);
        self
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Returns the isolation level.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Time since `begin`.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Effective lock and transaction timeouts.
    #[must_use]
    pub fn timeouts(&self) -> TimeoutLayers {
        self.timeouts
    }

    /// Token that interrupts this transaction's lock waits. Clones can be
    /// handed to other threads.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Why the transaction must abort, if it must.
    #[must_use]
    pub fn must_abort(&self) -> Option<&str> {
        self.must_abort.as_deref()
    }

    /// Number of puts and deletes logged by this transaction.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes
    }

    /// Deadlines for a lock wait starting now.
    pub(crate) fn deadlines(&self, request_timeout: Option<Duration>) -> WaitDeadlines {
        WaitDeadlines::new(
            Instant::now(),
            self.timeouts.lock_timeout_for(request_timeout),
            self.started,
            self.timeouts.txn_timeout(),
        )
    }

    /// Fails unless the transaction is active and not marked for abort.
    /// A transaction found past its timeout is marked here.
    pub(crate) fn ensure_usable(&mut self) -> CoreResult<()> {
        self.ensure_active()?;
        if self.must_abort.is_none() {
            if let Some(limit) = self.timeouts.txn_timeout() {
                if self.elapsed() >= limit {
                    self.mark_must_abort(&CoreError::TransactionTimeout {
                        txid: self.id,
                        limit,
                    });
                }
            }
        }
        match &self.must_abort {
            Some(reason) => Err(CoreError::TransactionMustAbort {
                txid: self.id,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Fails unless the transaction is active.
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        if self.state != TxnState::Active {
            return Err(CoreError::invalid_operation(format!(
                "{} is not active (state: {:?})",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Marks the transaction must-abort if `err` demands it. The first
    /// reason sticks.
    pub(crate) fn note_error(&mut self, err: &CoreError) {
        if err.is_fatal_to_transaction() {
            self.mark_must_abort(err);
        }
    }

    fn mark_must_abort(&mut self, err: &CoreError) {
        if self.must_abort.is_none() {
            tracing::debug!(txid = %self.id, error = %err, "transaction marked must-abort");
            self.must_abort = Some(err.to_string());
        }
    }

    pub(crate) fn record_write(&mut self) {
        self.writes += 1;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TxnState::Committed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TxnState::Aborted;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        self.state = TxnState::Aborted;
        let Some(release) = self.release.take() else {
            return;
        };
        let discarded = release.state.lock().discard(self.id);
        let released = release.locks.release_all(self.id);
        release.stats.record_abort();
        tracing::debug!(
            txid = %self.id,
            writes = self.writes,
            discarded,
            released,
            "unresolved transaction dropped"
        );
    }
}
