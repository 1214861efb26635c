//! Property-based test generators using proptest.
//!
//! Keys and values come from small alphabets so that generated workloads
//! collide often: duplicates, deletes that hit, and deletes that miss.

use crate::model::number_records;
use proptest::prelude::*;
use std::collections::BTreeMap;
use stowdb_core::{LogEntry, LogRecord, TransactionId};

/// Strategy for keys `k0`..`k3`.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    (0u8..4).prop_map(|i| format!("k{i}").into_bytes())
}

/// Strategy for values `v0`..`v3`.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    (0u8..4).prop_map(|i| format!("v{i}").into_bytes())
}

/// How a generated transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A commit record follows its work.
    Commit,
    /// An abort record follows its work.
    Abort,
    /// The log ends with the transaction open.
    Unresolved,
}

fn resolution_strategy() -> impl Strategy<Value = Resolution> {
    prop_oneof![
        3 => Just(Resolution::Commit),
        1 => Just(Resolution::Abort),
        1 => Just(Resolution::Unresolved),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>, Option<Vec<u8>>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (key_strategy(), prop::option::of(value_strategy()))
            .prop_map(|(k, v)| Op::Delete(k, v)),
    ]
}

/// Largest transaction id a workload uses.
pub const MAX_WORKLOAD_TXNS: u64 = 4;

/// A generated log: interleaved work of several transactions and
/// non-transactional writes, each transaction resolved at a random point
/// after its last operation, or not at all.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Records in LSN order, numbered from 1.
    pub records: Vec<LogRecord>,
    /// How each transaction that did work ends.
    pub resolutions: BTreeMap<TransactionId, Resolution>,
}

impl Workload {
    /// Transactions that did work and committed.
    pub fn committed(&self) -> Vec<TransactionId> {
        self.with_resolution(Resolution::Commit)
    }

    /// Transactions with the given ending.
    pub fn with_resolution(&self, resolution: Resolution) -> Vec<TransactionId> {
        self.resolutions
            .iter()
            .filter(|(_, r)| **r == resolution)
            .map(|(t, _)| *t)
            .collect()
    }

    /// The same log with `txid`'s commit record replaced by an abort.
    pub fn with_commit_as_abort(&self, txid: TransactionId) -> Vec<LogRecord> {
        self.map_entries(|entry| match entry {
            LogEntry::Commit { txid: t } if *t == txid => Some(LogEntry::abort(txid)),
            other => Some(other.clone()),
        })
    }

    /// The same log with `txid`'s resolution record dropped.
    pub fn without_resolution(&self, txid: TransactionId) -> Vec<LogRecord> {
        self.map_entries(|entry| match entry {
            LogEntry::Commit { txid: t } | LogEntry::Abort { txid: t } if *t == txid => None,
            other => Some(other.clone()),
        })
    }

    /// The same log with every record of `txid` dropped.
    pub fn without_txn(&self, txid: TransactionId) -> Vec<LogRecord> {
        self.map_entries(|entry| {
            (entry.txid() != Some(txid)).then(|| entry.clone())
        })
    }

    fn map_entries(&self, f: impl Fn(&LogEntry) -> Option<LogEntry>) -> Vec<LogRecord> {
        number_records(self.records.iter().filter_map(|r| f(&r.entry)))
    }
}

/// Strategy for workloads of up to `max_ops` operations.
pub fn workload_strategy(max_ops: usize) -> impl Strategy<Value = Workload> {
    let slot = prop_oneof![
        1 => Just(None),
        3 => (1..=MAX_WORKLOAD_TXNS).prop_map(Some),
    ];
    let ends = prop::collection::vec(
        (resolution_strategy(), any::<usize>()),
        MAX_WORKLOAD_TXNS as usize,
    );
    (prop::collection::vec((slot, op_strategy()), 0..=max_ops), ends)
        .prop_map(|(ops, ends)| build_workload(ops, &ends))
}

fn build_workload(ops: Vec<(Option<u64>, Op)>, ends: &[(Resolution, usize)]) -> Workload {
    let mut entries: Vec<LogEntry> = ops
        .into_iter()
        .map(|(slot, op)| match (slot.map(TransactionId::new), op) {
            (None, Op::Put(k, v)) => LogEntry::put(k, v),
            (None, Op::Delete(k, Some(v))) => LogEntry::delete(k, v),
            (None, Op::Delete(k, None)) => LogEntry::delete_key(k),
            (Some(t), Op::Put(k, v)) => LogEntry::txn_put(t, k, v),
            (Some(t), Op::Delete(k, v)) => LogEntry::txn_delete(t, k, v),
        })
        .collect();

    let mut resolutions = BTreeMap::new();
    for (id, (resolution, at)) in (1..=MAX_WORKLOAD_TXNS).zip(ends) {
        let txid = TransactionId::new(id);
        let Some(last) = entries.iter().rposition(|e| e.txid() == Some(txid)) else {
            continue;
        };
        resolutions.insert(txid, *resolution);
        let record = match resolution {
            Resolution::Commit => LogEntry::commit(txid),
            Resolution::Abort => LogEntry::abort(txid),
            Resolution::Unresolved => continue,
        };
        // Anywhere after the transaction's last operation.
        let slots = entries.len() - last;
        entries.insert(last + 1 + at % slots, record);
    }

    Workload {
        records: number_records(entries),
        resolutions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_workloads_replay_cleanly() {
        let mut runner = TestRunner::default();
        runner
            .run(&workload_strategy(30), |workload| {
                prop_assert!(stowdb_core::replay(&workload.records).is_ok());
                for (i, record) in workload.records.iter().enumerate() {
                    prop_assert_eq!(record.lsn.as_u64(), i as u64 + 1);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn resolution_follows_last_operation() {
        let ops = vec![
            (Some(1), Op::Put(b"k".to_vec(), b"v".to_vec())),
            (None, Op::Put(b"a".to_vec(), b"b".to_vec())),
        ];
        let ends = vec![(Resolution::Commit, 0usize); 4];
        let workload = build_workload(ops, &ends);
        assert_eq!(workload.records.len(), 3);
        assert_eq!(workload.records[1].entry, LogEntry::commit(TransactionId::new(1)));
        assert_eq!(workload.committed(), vec![TransactionId::new(1)]);
    }
}
