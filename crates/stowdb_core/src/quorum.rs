//! Replica acknowledgement quorum.
//!
//! A commit that needs a quorum starts a round for its LSN and waits until
//! enough replicas report that they hold it. The waiting is done by a
//! [`SizeGatedMap`] keyed by replica, so an ack that reaches the quorum wakes
//! the committer without polling and a shutdown releases it at once.

use crate::error::CoreResult;
use crate::sync::{CancelToken, SizeGatedMap};
use crate::types::Lsn;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// Identifies a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    /// Creates a replica id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica:{}", self.0)
    }
}

/// Counts replicas that acknowledged the current round's LSN.
///
/// The round target is held under a lock that both
/// [`start_round`](Self::start_round) and [`record_ack`](Self::record_ack)
/// take, so an ack checked against one round is never stored into the next.
#[derive(Debug, Default)]
pub struct AckQuorum {
    acks: SizeGatedMap<ReplicaId, Lsn>,
    target: Mutex<Lsn>,
}

impl AckQuorum {
    /// Creates a quorum with no round started; every ack counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a round for `target`. Acks collected so far are dropped.
    pub fn start_round(&self, target: Lsn) {
        let mut current = self.target.lock();
        *current = target;
        self.acks.clear();
    }

    /// LSN the current round waits for.
    #[must_use]
    pub fn target(&self) -> Lsn {
        *self.target.lock()
    }

    /// Records that `replica` holds the log up to `lsn`. Acks below the
    /// round's target are ignored. Returns whether the ack counted.
    pub fn record_ack(&self, replica: ReplicaId, lsn: Lsn) -> bool {
        let target = self.target.lock();
        if lsn < *target {
            let current = *target;
            tracing::trace!(%replica, %lsn, target = %current, "stale ack ignored");
            return false;
        }
        self.acks.put(replica, lsn);
        true
    }

    /// Number of replicas that acknowledged this round.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.acks.len()
    }

    /// Blocks until `n` replicas acknowledged this round.
    ///
    /// Returns `Ok(false)` if `timeout` elapses first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WaitAbandoned`](crate::CoreError::WaitAbandoned)
    /// after [`shutdown`](Self::shutdown), or
    /// [`CoreError::Interrupted`](crate::CoreError::Interrupted) when
    /// `cancel` fires.
    pub fn await_quorum(
        &self,
        n: usize,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> CoreResult<bool> {
        let reached = self.acks.wait_for_size_cancellable(n, timeout, cancel)?;
        if !reached {
            tracing::warn!(
                needed = n,
                acked = self.acked(),
                target = %self.target(),
                "quorum wait timed out"
            );
        }
        Ok(reached)
    }

    /// Fails every current and future quorum wait until
    /// [`reset`](Self::reset).
    pub fn shutdown(&self, cause: impl Into<String>) {
        self.acks.abandon(cause);
    }

    /// Allows quorum waits again after a shutdown.
    pub fn reset(&self) {
        self.acks.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn quorum_reached_by_acks_from_other_threads() {
        let quorum = Arc::new(AckQuorum::new());
        quorum.start_round(Lsn::new(10));

        let acker = {
            let quorum = Arc::clone(&quorum);
            thread::spawn(move || {
                for id in 0..3 {
                    quorum.record_ack(ReplicaId::new(id), Lsn::new(10 + u64::from(id)));
                }
            })
        };
        let reached = quorum
            .await_quorum(3, Some(Duration::from_secs(5)), &CancelToken::new())
            .unwrap();
        assert!(reached);
        acker.join().unwrap();
    }

    #[test]
    fn stale_acks_do_not_count() {
        let quorum = AckQuorum::new();
        quorum.start_round(Lsn::new(5));
        assert!(!quorum.record_ack(ReplicaId::new(1), Lsn::new(4)));
        assert!(quorum.record_ack(ReplicaId::new(2), Lsn::new(5)));
        assert_eq!(quorum.acked(), 1);
        assert!(!quorum
            .await_quorum(2, Some(Duration::from_millis(10)), &CancelToken::new())
            .unwrap());
    }

    #[test]
    fn new_round_drops_old_acks() {
        let quorum = AckQuorum::new();
        quorum.record_ack(ReplicaId::new(1), Lsn::new(1));
        quorum.start_round(Lsn::new(2));
        assert_eq!(quorum.acked(), 0);
        assert_eq!(quorum.target(), Lsn::new(2));
    }

    #[test]
    fn acks_from_an_old_round_never_outlive_it() {
        let quorum = Arc::new(AckQuorum::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ackers: Vec<_> = (0..4)
            .map(|id| {
                let quorum = Arc::clone(&quorum);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        let seen = quorum.target();
                        quorum.record_ack(ReplicaId::new(id), seen);
                    }
                })
            })
            .collect();

        for round in 1..=500 {
            let target = Lsn::new(round);
            quorum.start_round(target);
            let acks = quorum.acks.snapshot();
            assert!(acks.values().all(|lsn| *lsn >= target), "round {round}: {acks:?}");
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for acker in ackers {
            acker.join().unwrap();
        }
    }

    #[test]
    fn shutdown_releases_waiters_until_reset() {
        let quorum = Arc::new(AckQuorum::new());
        let waiter = {
            let quorum = Arc::clone(&quorum);
            thread::spawn(move || quorum.await_quorum(2, None, &CancelToken::new()))
        };
        while quorum.acks.waiting() == 0 {
            thread::yield_now();
        }
        quorum.shutdown("primary stepping down");
        assert!(matches!(
            waiter.join().unwrap(),
            Err(CoreError::WaitAbandoned { cause }) if cause == "primary stepping down"
        ));
        assert!(quorum.await_quorum(0, None, &CancelToken::new()).is_err());

        quorum.reset();
        assert!(quorum.await_quorum(0, None, &CancelToken::new()).unwrap());
    }

    #[test]
    fn cancel_interrupts_quorum_wait() {
        let quorum = Arc::new(AckQuorum::new());
        let token = CancelToken::new();
        let waiter = {
            let quorum = Arc::clone(&quorum);
            let token = token.clone();
            thread::spawn(move || quorum.await_quorum(1, None, &token))
        };
        while quorum.acks.waiting() == 0 {
            thread::yield_now();
        }
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(CoreError::Interrupted)));
    }
}
