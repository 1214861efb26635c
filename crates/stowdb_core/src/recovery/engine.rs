//! Recovery from the log.

use crate::error::CoreResult;
use crate::log::LogManager;
use crate::recovery::replay::{ReplayState, ReplayStats};
use crate::types::{Lsn, TransactionId};

/// Result of a recovery pass.
#[derive(Debug)]
pub struct RecoveryOutcome {
    /// Replay state after the last record in the pass.
    pub state: ReplayState,
    /// Replay counters.
    pub stats: ReplayStats,
    /// Transactions with work in the log and no commit or abort.
    pub unresolved: Vec<TransactionId>,
    /// First transaction id safe to hand out.
    pub next_txid: TransactionId,
    /// LSN following the last replayed record.
    pub next_lsn: Lsn,
}

/// Rebuilds the live record set from a log.
///
/// ```rust
/// use stowdb_core::{LogEntry, LogManager, RecoveryEngine, TransactionId};
/// use stowdb_storage::MemoryStore;
///
/// let log = LogManager::open(Box::new(MemoryStore::new())).unwrap();
/// log.append(&LogEntry::put("k1", "v1")).unwrap();
/// log.append(&LogEntry::txn_put(TransactionId::new(1), "k2", "v2")).unwrap();
///
/// let outcome = RecoveryEngine::new(&log).recover().unwrap();
/// assert_eq!(outcome.state.live().len(), 1);
/// assert_eq!(outcome.unresolved, vec![TransactionId::new(1)]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RecoveryEngine<'a> {
    log: &'a LogManager,
}

impl<'a> RecoveryEngine<'a> {
    /// Creates an engine over `log`.
    #[must_use]
    pub fn new(log: &'a LogManager) -> Self {
        Self { log }
    }

    /// Replays the whole log.
    ///
    /// # Errors
    ///
    /// See [`replay_up_to`](Self::replay_up_to).
    pub fn recover(&self) -> CoreResult<RecoveryOutcome> {
        self.replay_up_to(None)
    }

    /// Replays every record with LSN at most `target`.
    ///
    /// The whole prefix is read and decoded before anything is applied, so
    /// a corrupt record anywhere in it fails the pass with no partial
    /// state. Transactions still open at `target` are treated as aborted.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for an undecodable record or an invalid
    /// record sequence, or a storage error if the log cannot be read.
    pub fn replay_up_to(&self, target: Option<Lsn>) -> CoreResult<RecoveryOutcome> {
        let records = self.log.read_up_to(target)?;

        let mut state = ReplayState::new();
        for record in &records {
            state.apply(record)?;
        }

        let stats = state.stats();
        let unresolved = state.unresolved();
        let next_txid = TransactionId::new(state.max_txid().map_or(1, |t| t.as_u64() + 1));
        let next_lsn = state.last_lsn().next();

        tracing::info!(
            records = stats.records,
            committed = stats.committed,
            aborted = stats.aborted,
            unresolved = unresolved.len(),
            live = state.live().len(),
            "log replay complete"
        );
        if stats.unknown_resolutions > 0 {
            tracing::debug!(
                count = stats.unknown_resolutions,
                "resolutions without buffered work"
            );
        }

        Ok(RecoveryOutcome {
            state,
            stats,
            unresolved,
            next_txid,
            next_lsn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;
    use crate::recovery::LiveRecordSet;
    use stowdb_storage::MemoryStore;

    fn scenario_a() -> LogManager {
        let log = LogManager::open(Box::new(MemoryStore::new())).unwrap();
        let t1 = TransactionId::new(1);
        log.append(&LogEntry::put("k1", "v1")).unwrap();
        log.append(&LogEntry::txn_put(t1, "k2", "v2")).unwrap();
        log.append(&LogEntry::put("k3", "v3")).unwrap();
        log.append(&LogEntry::commit(t1)).unwrap();
        log
    }

    #[test]
    fn replay_through_each_prefix() {
        let log = scenario_a();
        let engine = RecoveryEngine::new(&log);

        let before_commit = engine.replay_up_to(Some(Lsn::new(3))).unwrap();
        let expected: LiveRecordSet = [("k1", "v1"), ("k3", "v3")].into_iter().collect();
        assert_eq!(before_commit.state.live(), &expected);
        assert_eq!(before_commit.unresolved, vec![TransactionId::new(1)]);
        assert_eq!(before_commit.next_lsn, Lsn::new(4));

        let full = engine.recover().unwrap();
        let expected: LiveRecordSet =
            [("k1", "v1"), ("k2", "v2"), ("k3", "v3")].into_iter().collect();
        assert_eq!(full.state.live(), &expected);
        assert!(full.unresolved.is_empty());
        assert_eq!(full.next_txid, TransactionId::new(2));
        assert_eq!(full.stats.committed, 1);
    }

    #[test]
    fn empty_log_recovers_to_empty_set() {
        let log = LogManager::open(Box::new(MemoryStore::new())).unwrap();
        let outcome = RecoveryEngine::new(&log).recover().unwrap();
        assert!(outcome.state.live().is_empty());
        assert_eq!(outcome.next_txid, TransactionId::new(1));
        assert_eq!(outcome.next_lsn, Lsn::new(1));
    }

    #[test]
    fn corruption_anywhere_fails_the_whole_pass() {
        let mem = MemoryStore::new();
        let log = LogManager::open(Box::new(mem.clone())).unwrap();
        log.append(&LogEntry::put("a", "1")).unwrap();
        let second = log.size().unwrap() as usize;
        log.append(&LogEntry::put("b", "2")).unwrap();
        mem.corrupt_byte(second + 6, 0x7F);

        let err = RecoveryEngine::new(&log).recover().unwrap_err();
        assert!(err.is_corruption());
    }
}
