//! Wait-for graph used to find deadlocks.
//!
//! An edge `waiter -> holder` means `waiter` is queued behind `holder`.
//! A cycle is a deadlock. The victim is the youngest transaction in the
//! cycle, which is the one with the largest id.

use crate::types::TransactionId;
use std::collections::{BTreeMap, BTreeSet};

/// Directed wait-for graph. Ordered maps keep cycle search deterministic.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<TransactionId, BTreeSet<TransactionId>>,
}

impl WaitForGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every outgoing edge of `waiter`.
    pub fn set_waits(&mut self, waiter: TransactionId, blockers: BTreeSet<TransactionId>) {
        if blockers.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges.insert(waiter, blockers);
        }
    }

    /// Removes the outgoing edges of `waiter`.
    pub fn clear_waits(&mut self, waiter: TransactionId) {
        self.edges.remove(&waiter);
    }

    /// Removes `txid` from the graph entirely.
    pub fn remove_txn(&mut self, txid: TransactionId) {
        self.edges.remove(&txid);
        self.edges.retain(|_, blockers| {
            blockers.remove(&txid);
            !blockers.is_empty()
        });
    }

    /// Finds a cycle through `start`, returned as the path starting there.
    #[must_use]
    pub fn cycle_through(&self, start: TransactionId) -> Option<Vec<TransactionId>> {
        let mut path = vec![start];
        let mut visited = BTreeSet::new();
        self.search(start, start, &mut path, &mut visited)
            .then_some(path)
    }

    fn search(
        &self,
        node: TransactionId,
        target: TransactionId,
        path: &mut Vec<TransactionId>,
        visited: &mut BTreeSet<TransactionId>,
    ) -> bool {
        let Some(blockers) = self.edges.get(&node) else {
            return false;
        };
        for &next in blockers {
            if next == target {
                return true;
            }
            if visited.insert(next) {
                path.push(next);
                if self.search(next, target, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    /// Picks the youngest transaction in `cycle`.
    #[must_use]
    pub fn choose_victim(cycle: &[TransactionId]) -> Option<TransactionId> {
        cycle.iter().max().copied()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn blockers(ids: &[u64]) -> BTreeSet<TransactionId> {
        ids.iter().copied().map(t).collect()
    }

    #[test]
    fn two_way_cycle() {
        let mut graph = WaitForGraph::new();
        graph.set_waits(t(1), blockers(&[2]));
        assert_eq!(graph.cycle_through(t(1)), None);
        graph.set_waits(t(2), blockers(&[1]));
        assert_eq!(graph.cycle_through(t(2)), Some(vec![t(2), t(1)]));
    }

    #[test]
    fn three_way_cycle_picks_youngest() {
        let mut graph = WaitForGraph::new();
        graph.set_waits(t(5), blockers(&[9]));
        graph.set_waits(t(9), blockers(&[3]));
        graph.set_waits(t(3), blockers(&[5]));
        let cycle = graph.cycle_through(t(3)).unwrap();
        assert_eq!(cycle, vec![t(3), t(5), t(9)]);
        assert_eq!(WaitForGraph::choose_victim(&cycle), Some(t(9)));
    }

    #[test]
    fn cycle_not_through_start_is_ignored() {
        let mut graph = WaitForGraph::new();
        graph.set_waits(t(1), blockers(&[2]));
        graph.set_waits(t(2), blockers(&[3]));
        graph.set_waits(t(3), blockers(&[2]));
        assert_eq!(graph.cycle_through(t(1)), None);
        assert!(graph.cycle_through(t(2)).is_some());
    }

    #[test]
    fn removing_a_transaction_breaks_cycles() {
        let mut graph = WaitForGraph::new();
        graph.set_waits(t(1), blockers(&[2]));
        graph.set_waits(t(2), blockers(&[1]));
        graph.remove_txn(t(2));
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.cycle_through(t(1)), None);
    }
}
