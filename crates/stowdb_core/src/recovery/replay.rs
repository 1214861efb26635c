//! Single-pass replay of log records into a live record set.

use crate::error::{CoreError, CoreResult};
use crate::log::{LogEntry, LogRecord};
use crate::recovery::live_set::LiveRecordSet;
use crate::types::{Lsn, TransactionId};
use std::collections::{BTreeMap, BTreeSet};

/// Buffered effects of a transaction that has not resolved yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingTxn {
    inserts: BTreeSet<(Vec<u8>, Vec<u8>)>,
    deletes: BTreeSet<(Vec<u8>, Option<Vec<u8>>)>,
}

impl PendingTxn {
    /// Pending inserts.
    pub fn inserts(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.inserts.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Pending deletes; `None` is the key-only sentinel.
    pub fn deletes(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> + '_ {
        self.deletes
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    /// Buffers an insert.
    pub fn record_insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.inserts.insert((key, value));
    }

    /// Buffers a delete.
    pub fn record_delete(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        self.deletes.insert((key, value));
    }

    /// Values `key` would hold if this transaction committed on top of
    /// `committed`.
    #[must_use]
    pub fn view(&self, key: &[u8], committed: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut scratch = LiveRecordSet::new();
        for value in committed {
            scratch.insert(key.to_vec(), value.clone());
        }
        let own = Self {
            inserts: self
                .inserts
                .iter()
                .filter(|(k, _)| k == key)
                .cloned()
                .collect(),
            deletes: self
                .deletes
                .iter()
                .filter(|(k, _)| k == key)
                .cloned()
                .collect(),
        };
        own.commit_into(&mut scratch);
        scratch.values(key).to_vec()
    }

    /// Applies the buffered effects to `live`.
    ///
    /// Each delete first cancels one of this transaction's own matching
    /// inserts, so an insert and delete of the same pair net to absence in
    /// whatever order they were logged. Exact deletes are matched before
    /// key-only ones. Inserts left over are added, then deletes left over
    /// remove the first match from `live`. Returns the number of deletes
    /// that found nothing to remove.
    pub fn commit_into(self, live: &mut LiveRecordSet) -> usize {
        let mut inserts = self.inserts;
        let mut leftover = Vec::new();

        let (exact, sentinel): (Vec<_>, Vec<_>) =
            self.deletes.into_iter().partition(|(_, v)| v.is_some());
        for (key, value) in exact.into_iter().chain(sentinel) {
            let cancelled = match &value {
                Some(v) => inserts.remove(&(key.clone(), v.clone())),
                None => {
                    let hit = inserts.iter().find(|(k, _)| *k == key).cloned();
                    hit.is_some_and(|pair| inserts.remove(&pair))
                }
            };
            if !cancelled {
                leftover.push((key, value));
            }
        }

        for (key, value) in inserts {
            live.insert(key, value);
        }
        leftover
            .iter()
            .filter(|(key, value)| !live.remove(key, value.as_deref()))
            .count()
    }
}

/// Counters gathered during replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied.
    pub records: u64,
    /// Non-transactional puts and deletes.
    pub non_txnal_ops: u64,
    /// Transactional puts and deletes buffered.
    pub txnal_ops: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions aborted.
    pub aborted: u64,
    /// Commit or abort records naming a transaction with no buffered work.
    pub unknown_resolutions: u64,
    /// Deletes that matched nothing.
    pub missed_deletes: u64,
}

/// Replay state: the live set plus every unresolved transaction.
///
/// Feed records in LSN order through [`apply`](Self::apply). The state is
/// the same whether records arrive one by one or as a batch through
/// [`replay`].
#[derive(Debug, Clone, Default)]
pub struct ReplayState {
    live: LiveRecordSet,
    pending: BTreeMap<TransactionId, PendingTxn>,
    last_lsn: Lsn,
    max_txid: Option<TransactionId>,
    stats: ReplayStats,
}

impl ReplayState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one record.
    ///
    /// The record is checked before anything changes, so a rejected record
    /// leaves the state as it was.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the LSN does not follow the
    /// previous record.
    pub fn apply(&mut self, record: &LogRecord) -> CoreResult<()> {
        if record.lsn <= self.last_lsn {
            return Err(CoreError::corruption(format!(
                "{} replayed after {}",
                record.lsn, self.last_lsn
            )));
        }
        match &record.entry {
            LogEntry::NonTxnalPut { key, value } => {
                self.live.insert(key.clone(), value.clone());
                self.stats.non_txnal_ops += 1;
            }
            LogEntry::NonTxnalDelete { key, value } => {
                if !self.live.remove(key, value.as_deref()) {
                    self.stats.missed_deletes += 1;
                }
                self.stats.non_txnal_ops += 1;
            }
            LogEntry::TxnalPut { txid, key, value } => {
                self.pending
                    .entry(*txid)
                    .or_default()
                    .record_insert(key.clone(), value.clone());
                self.stats.txnal_ops += 1;
            }
            LogEntry::TxnalDelete { txid, key, value } => {
                self.pending
                    .entry(*txid)
                    .or_default()
                    .record_delete(key.clone(), value.clone());
                self.stats.txnal_ops += 1;
            }
            LogEntry::Commit { txid } => {
                match self.pending.remove(txid) {
                    Some(pending) => {
                        let missed = pending.commit_into(&mut self.live);
                        self.stats.missed_deletes += missed as u64;
                    }
                    None => self.note_unknown(*txid, record.lsn),
                }
                self.stats.committed += 1;
            }
            LogEntry::Abort { txid } => {
                if self.pending.remove(txid).is_none() {
                    self.note_unknown(*txid, record.lsn);
                }
                self.stats.aborted += 1;
            }
        }

        if let Some(txid) = record.entry.txid() {
            self.max_txid = self.max_txid.max(Some(txid));
        }
        self.last_lsn = record.lsn;
        self.stats.records += 1;
        Ok(())
    }

    fn note_unknown(&mut self, txid: TransactionId, lsn: Lsn) {
        tracing::debug!(%txid, %lsn, "resolution for transaction with no buffered work");
        self.stats.unknown_resolutions += 1;
    }

    /// The live record set as of the last applied record.
    #[must_use]
    pub fn live(&self) -> &LiveRecordSet {
        &self.live
    }

    /// Consumes the state, returning the live record set.
    #[must_use]
    pub fn into_live(self) -> LiveRecordSet {
        self.live
    }

    /// Buffered work of an unresolved transaction.
    #[must_use]
    pub fn pending(&self, txid: TransactionId) -> Option<&PendingTxn> {
        self.pending.get(&txid)
    }

    /// Forgets the pending work of `txid` without resolving it. Returns
    /// whether anything was pending.
    pub(crate) fn discard(&mut self, txid: TransactionId) -> bool {
        self.pending.remove(&txid).is_some()
    }

    /// Transactions with buffered work and no resolution yet, oldest first.
    #[must_use]
    pub fn unresolved(&self) -> Vec<TransactionId> {
        self.pending.keys().copied().collect()
    }

    /// LSN of the last applied record, or [`Lsn::ZERO`].
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Largest transaction id seen in any record.
    #[must_use]
    pub fn max_txid(&self) -> Option<TransactionId> {
        self.max_txid
    }

    /// Replay counters.
    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }
}

/// Replays `records` from an empty state.
///
/// The result depends only on the records given. On error nothing is
/// returned; the partial state is dropped.
///
/// # Errors
///
/// Returns the first error [`ReplayState::apply`] reports.
pub fn replay(records: &[LogRecord]) -> CoreResult<LiveRecordSet> {
    let mut state = ReplayState::new();
    for record in records {
        state.apply(record)?;
    }
    Ok(state.into_live())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn numbered(entries: Vec<LogEntry>) -> Vec<LogRecord> {
        entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| LogRecord::new(Lsn::new(i as u64 + 1), e))
            .collect()
    }

    fn set(pairs: &[(&str, &str)]) -> LiveRecordSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn scenario_a_prefix_and_full() {
        let log = numbered(vec![
            LogEntry::put("k1", "v1"),
            LogEntry::txn_put(t(1), "k2", "v2"),
            LogEntry::put("k3", "v3"),
            LogEntry::commit(t(1)),
        ]);
        assert_eq!(replay(&log[..3]).unwrap(), set(&[("k1", "v1"), ("k3", "v3")]));
        assert_eq!(
            replay(&log).unwrap(),
            set(&[("k1", "v1"), ("k2", "v2"), ("k3", "v3")])
        );
    }

    #[test]
    fn abort_discards_pending_work() {
        let log = numbered(vec![
            LogEntry::txn_put(t(1), "a", "1"),
            LogEntry::put("b", "2"),
            LogEntry::abort(t(1)),
        ]);
        assert_eq!(replay(&log).unwrap(), set(&[("b", "2")]));
    }

    #[test]
    fn insert_then_delete_nets_to_absence_in_any_order() {
        for entries in [
            vec![
                LogEntry::txn_put(t(1), "k", "v"),
                LogEntry::txn_delete(t(1), "k", Some(b"v".to_vec())),
                LogEntry::commit(t(1)),
            ],
            vec![
                LogEntry::txn_delete(t(1), "k", Some(b"v".to_vec())),
                LogEntry::txn_put(t(1), "k", "v"),
                LogEntry::commit(t(1)),
            ],
        ] {
            assert!(replay(&numbered(entries)).unwrap().is_empty());
        }
    }

    #[test]
    fn sentinel_delete_cancels_own_insert_before_touching_live_set() {
        let log = numbered(vec![
            LogEntry::put("k", "old"),
            LogEntry::txn_put(t(1), "k", "new"),
            LogEntry::txn_delete(t(1), "k", None),
            LogEntry::commit(t(1)),
        ]);
        assert_eq!(replay(&log).unwrap(), set(&[("k", "old")]));
    }

    #[test]
    fn committed_delete_hits_first_live_match() {
        let log = numbered(vec![
            LogEntry::put("k", "a"),
            LogEntry::put("k", "b"),
            LogEntry::txn_delete(t(7), "k", None),
            LogEntry::commit(t(7)),
        ]);
        assert_eq!(replay(&log).unwrap(), set(&[("k", "b")]));
    }

    #[test]
    fn unknown_resolution_is_a_noop() {
        let mut state = ReplayState::new();
        for record in numbered(vec![LogEntry::put("k", "v"), LogEntry::commit(t(9))]) {
            state.apply(&record).unwrap();
        }
        assert_eq!(state.live(), &set(&[("k", "v")]));
        assert_eq!(state.stats().unknown_resolutions, 1);
        assert!(state.unresolved().is_empty());
    }

    #[test]
    fn repeated_resolution_is_a_noop() {
        let log = numbered(vec![
            LogEntry::txn_put(t(1), "k", "v"),
            LogEntry::commit(t(1)),
            LogEntry::commit(t(1)),
            LogEntry::abort(t(1)),
        ]);
        let mut state = ReplayState::new();
        for record in &log {
            state.apply(record).unwrap();
        }
        assert_eq!(state.live(), &set(&[("k", "v")]));
        assert_eq!(state.stats().unknown_resolutions, 2);
    }

    #[test]
    fn work_after_resolution_stays_pending() {
        let log = numbered(vec![
            LogEntry::txn_put(t(1), "k", "v"),
            LogEntry::commit(t(1)),
            LogEntry::txn_put(t(1), "k", "w"),
        ]);
        let mut state = ReplayState::new();
        for record in &log {
            state.apply(record).unwrap();
        }
        assert_eq!(state.live(), &set(&[("k", "v")]));
        assert_eq!(state.unresolved(), vec![t(1)]);
        assert_eq!(replay(&log).unwrap(), set(&[("k", "v")]));
    }

    #[test]
    fn non_increasing_lsn_is_corruption() {
        let mut state = ReplayState::new();
        state
            .apply(&LogRecord::new(Lsn::new(5), LogEntry::put("a", "1")))
            .unwrap();
        let err = state
            .apply(&LogRecord::new(Lsn::new(5), LogEntry::put("b", "2")))
            .unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(state.live().len(), 1);
    }

    #[test]
    fn unresolved_transactions_are_reported() {
        let mut state = ReplayState::new();
        for record in numbered(vec![
            LogEntry::txn_put(t(3), "a", "1"),
            LogEntry::txn_put(t(2), "b", "2"),
            LogEntry::abort(t(3)),
        ]) {
            state.apply(&record).unwrap();
        }
        assert_eq!(state.unresolved(), vec![t(2)]);
        assert_eq!(state.max_txid(), Some(t(3)));
    }

    #[test]
    fn pending_view_reads_own_writes() {
        let mut pending = PendingTxn::default();
        pending.record_insert(b"k".to_vec(), b"mine".to_vec());
        pending.record_delete(b"k".to_vec(), Some(b"theirs".to_vec()));
        let view = pending.view(b"k", &[b"theirs".to_vec(), b"other".to_vec()]);
        assert_eq!(view, vec![b"other".to_vec(), b"mine".to_vec()]);
    }

    fn arb_entry() -> impl Strategy<Value = LogEntry> {
        let key = prop::sample::select(vec!["a", "b", "c"]);
        let value = prop::sample::select(vec!["1", "2"]);
        let txid = (1u64..4).prop_map(TransactionId::new);
        prop_oneof![
            (key.clone(), value.clone()).prop_map(|(k, v)| LogEntry::put(k, v)),
            (key.clone(), prop::option::of(value.clone()))
                .prop_map(|(k, v)| LogEntry::NonTxnalDelete {
                    key: k.into(),
                    value: v.map(Into::into),
                }),
            (txid.clone(), key.clone(), value.clone())
                .prop_map(|(t, k, v)| LogEntry::txn_put(t, k, v)),
            (txid.clone(), key, prop::option::of(value))
                .prop_map(|(t, k, v)| LogEntry::txn_delete(t, k, v.map(Into::into))),
        ]
    }

    /// Work for txns 1..4 followed by a resolution for each, in a shuffled
    /// but valid order.
    fn arb_log() -> impl Strategy<Value = (Vec<LogEntry>, Vec<bool>)> {
        (
            prop::collection::vec(arb_entry(), 0..30),
            prop::collection::vec(any::<bool>(), 3),
        )
    }

    fn resolve(entries: &[LogEntry], commits: &[bool]) -> Vec<LogRecord> {
        let mut all = entries.to_vec();
        for (i, commit) in commits.iter().enumerate() {
            let txid = t(i as u64 + 1);
            all.push(if *commit {
                LogEntry::commit(txid)
            } else {
                LogEntry::abort(txid)
            });
        }
        numbered(all)
    }

    proptest! {
        #[test]
        fn replay_is_deterministic((entries, commits) in arb_log(), cut in 0usize..40) {
            let log = resolve(&entries, &commits);
            let cut = cut.min(log.len());
            prop_assert_eq!(replay(&log[..cut]).unwrap(), replay(&log[..cut]).unwrap());
        }

        #[test]
        fn abort_matches_dropping_the_transaction((entries, commits) in arb_log()) {
            let mut aborted = commits.clone();
            aborted[0] = false;
            let without: Vec<_> = entries
                .iter()
                .filter(|e| e.txid() != Some(t(1)))
                .cloned()
                .collect();
            prop_assert_eq!(
                replay(&resolve(&entries, &aborted)).unwrap(),
                replay(&resolve(&without, &aborted)).unwrap()
            );
        }

        #[test]
        fn missing_resolution_matches_abort((entries, commits) in arb_log()) {
            let mut aborted = commits.clone();
            aborted[2] = false;
            let full = resolve(&entries, &aborted);
            let mut unresolved = full.clone();
            unresolved.pop();
            prop_assert_eq!(replay(&full).unwrap(), replay(&unresolved).unwrap());
        }

        #[test]
        fn streaming_apply_matches_batch_replay((entries, commits) in arb_log()) {
            let log = resolve(&entries, &commits);
            let mut state = ReplayState::new();
            for (i, record) in log.iter().enumerate() {
                state.apply(record).unwrap();
                prop_assert_eq!(state.live(), &replay(&log[..=i]).unwrap());
            }
        }
    }
}
