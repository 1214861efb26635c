//! Reference model and prefix verification.
//!
//! [`ReferenceModel`] keeps the live records as one flat list of pairs and
//! re-derives the effect of each transaction at its commit. It shares no
//! code with the engine's replay, so agreement between the two on every
//! prefix of a log is meaningful.

use std::collections::{BTreeMap, BTreeSet};
use stowdb_core::{
    CoreResult, LiveRecordSet, LogEntry, LogRecord, Lsn, ReplayState, TransactionId,
};

type Pair = (Vec<u8>, Vec<u8>);

/// A flat multiset model of the live record set.
#[derive(Debug, Clone, Default)]
pub struct ReferenceModel {
    live: Vec<Pair>,
    open: BTreeMap<TransactionId, Vec<LogEntry>>,
}

impl ReferenceModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the model for `entries` applied in order.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> Self {
        let mut model = Self::new();
        for entry in entries {
            model.apply(entry);
        }
        model
    }

    /// Applies one entry.
    pub fn apply(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::NonTxnalPut { key, value } => self.live.push((key.clone(), value.clone())),
            LogEntry::NonTxnalDelete { key, value } => {
                self.remove_first(key, value.as_deref());
            }
            LogEntry::TxnalPut { txid, .. } | LogEntry::TxnalDelete { txid, .. } => {
                self.open.entry(*txid).or_default().push(entry.clone());
            }
            LogEntry::Commit { txid } => {
                let ops = self.open.remove(txid).unwrap_or_default();
                self.commit(ops);
            }
            LogEntry::Abort { txid } => {
                self.open.remove(txid);
            }
        }
    }

    fn commit(&mut self, ops: Vec<LogEntry>) {
        let mut inserts = BTreeSet::new();
        let mut exact = BTreeSet::new();
        let mut by_key = BTreeSet::new();
        for op in ops {
            match op {
                LogEntry::TxnalPut { key, value, .. } => {
                    inserts.insert((key, value));
                }
                LogEntry::TxnalDelete {
                    key,
                    value: Some(value),
                    ..
                } => {
                    exact.insert((key, value));
                }
                LogEntry::TxnalDelete {
                    key, value: None, ..
                } => {
                    by_key.insert(key);
                }
                _ => {}
            }
        }

        let mut deletes: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        for pair in exact {
            if !inserts.remove(&pair) {
                deletes.push((pair.0, Some(pair.1)));
            }
        }
        for key in by_key {
            let own = inserts.iter().find(|(k, _)| *k == key).cloned();
            match own {
                Some(pair) => {
                    inserts.remove(&pair);
                }
                None => deletes.push((key, None)),
            }
        }

        self.live.extend(inserts);
        for (key, value) in deletes {
            self.remove_first(&key, value.as_deref());
        }
    }

    fn remove_first(&mut self, key: &[u8], value: Option<&[u8]>) {
        let hit = self
            .live
            .iter()
            .position(|(k, v)| k == key && value.is_none_or(|value| v == value));
        if let Some(index) = hit {
            self.live.remove(index);
        }
    }

    /// Live pairs sorted by key, values in insertion order.
    pub fn pairs(&self) -> Vec<Pair> {
        let mut pairs = self.live.clone();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    /// Whether the model agrees with `live`.
    pub fn matches(&self, live: &LiveRecordSet) -> bool {
        self.pairs() == live.to_pairs()
    }
}

/// First prefix on which replay disagreed with the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixDivergence {
    /// LSN of the last record in the prefix, or [`Lsn::ZERO`] for the empty
    /// prefix.
    pub lsn: Lsn,
    /// Pairs the model holds.
    pub expected: Vec<Pair>,
    /// Pairs replay produced.
    pub actual: Vec<Pair>,
}

/// Replays every prefix of a record list and checks each against the
/// reference model.
///
/// Streaming replay through [`ReplayState::apply`] and batch replay through
/// [`stowdb_core::replay`] are both checked on every prefix.
#[derive(Debug, Clone)]
pub struct PrefixHarness {
    records: Vec<LogRecord>,
}

impl PrefixHarness {
    /// Creates a harness over `records`, which must be in LSN order.
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self { records }
    }

    /// Number of prefixes checked, including the empty one.
    pub fn prefix_count(&self) -> usize {
        self.records.len() + 1
    }

    /// Checks every prefix. Returns the first divergence, if any.
    ///
    /// # Errors
    ///
    /// Returns the replay error if a record is rejected.
    pub fn verify(&self) -> CoreResult<Option<PrefixDivergence>> {
        let mut state = ReplayState::new();
        let mut model = ReferenceModel::new();

        if let Some(divergence) = check(Lsn::ZERO, &model, state.live()) {
            return Ok(Some(divergence));
        }
        for (i, record) in self.records.iter().enumerate() {
            state.apply(record)?;
            model.apply(&record.entry);
            if let Some(divergence) = check(record.lsn, &model, state.live()) {
                return Ok(Some(divergence));
            }
            let batch = stowdb_core::replay(&self.records[..=i])?;
            if let Some(divergence) = check(record.lsn, &model, &batch) {
                return Ok(Some(divergence));
            }
        }
        Ok(None)
    }
}

fn check(lsn: Lsn, model: &ReferenceModel, live: &LiveRecordSet) -> Option<PrefixDivergence> {
    (!model.matches(live)).then(|| PrefixDivergence {
        lsn,
        expected: model.pairs(),
        actual: live.to_pairs(),
    })
}

/// Assigns LSNs 1, 2, ... to `entries`.
pub fn number_records(entries: impl IntoIterator<Item = LogEntry>) -> Vec<LogRecord> {
    entries
        .into_iter()
        .zip(1u64..)
        .map(|(entry, lsn)| LogRecord::new(Lsn::new(lsn), entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn model_follows_scenario_a() {
        let entries = [
            LogEntry::put("k1", "v1"),
            LogEntry::txn_put(t(1), "k2", "v2"),
            LogEntry::put("k3", "v3"),
            LogEntry::commit(t(1)),
        ];
        let partial = ReferenceModel::from_entries(&entries[..3]);
        assert_eq!(partial.pairs().len(), 2);
        let full = ReferenceModel::from_entries(&entries);
        assert_eq!(
            full.pairs(),
            vec![
                (b"k1".to_vec(), b"v1".to_vec()),
                (b"k2".to_vec(), b"v2".to_vec()),
                (b"k3".to_vec(), b"v3".to_vec()),
            ]
        );
    }

    #[test]
    fn harness_accepts_interleaved_log() {
        let records = number_records([
            LogEntry::put("k", "a"),
            LogEntry::txn_delete(t(1), "k", None),
            LogEntry::txn_put(t(2), "k", "b"),
            LogEntry::txn_put(t(1), "k", "c"),
            LogEntry::delete_key("k"),
            LogEntry::commit(t(2)),
            LogEntry::txn_delete(t(3), "k", Some(b"b".to_vec())),
            LogEntry::commit(t(1)),
            LogEntry::abort(t(3)),
        ]);
        let harness = PrefixHarness::new(records);
        assert_eq!(harness.prefix_count(), 10);
        assert_eq!(harness.verify().unwrap(), None);
    }

    #[test]
    fn harness_reports_replay_errors() {
        let records = vec![
            LogRecord::new(Lsn::new(2), LogEntry::put("a", "1")),
            LogRecord::new(Lsn::new(2), LogEntry::put("b", "2")),
        ];
        assert!(PrefixHarness::new(records).verify().is_err());
    }
}
