//! Named replay scenarios.
//!
//! A scenario is a list of log entries, an optional truncation point and
//! the live pairs replay must produce. Scenarios serialize to JSON so they
//! can be kept as fixtures next to the tests that use them.

use serde::{Deserialize, Serialize};
use stowdb_core::{
    CoreResult, LiveRecordSet, LogEntry, LogManager, Lsn, RecoveryEngine, TransactionId,
};
use stowdb_storage::MemoryStore;

/// One log entry in a scenario. Keys and values are UTF-8 for readability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioEntry {
    /// Non-transactional insert.
    Put {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// Non-transactional delete; no value deletes the first under the key.
    Delete {
        /// Key.
        key: String,
        /// Value, if exact.
        #[serde(default)]
        value: Option<String>,
    },
    /// Transactional insert.
    TxnPut {
        /// Transaction id.
        txn: u64,
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// Transactional delete.
    TxnDelete {
        /// Transaction id.
        txn: u64,
        /// Key.
        key: String,
        /// Value, if exact.
        #[serde(default)]
        value: Option<String>,
    },
    /// Commit.
    Commit {
        /// Transaction id.
        txn: u64,
    },
    /// Abort.
    Abort {
        /// Transaction id.
        txn: u64,
    },
}

impl ScenarioEntry {
    /// The log entry this stands for.
    pub fn to_log_entry(&self) -> LogEntry {
        match self {
            Self::Put { key, value } => LogEntry::put(key.as_str(), value.as_str()),
            Self::Delete { key, value: None } => LogEntry::delete_key(key.as_str()),
            Self::Delete {
                key,
                value: Some(value),
            } => LogEntry::delete(key.as_str(), value.as_str()),
            Self::TxnPut { txn, key, value } => {
                LogEntry::txn_put(TransactionId::new(*txn), key.as_str(), value.as_str())
            }
            Self::TxnDelete { txn, key, value } => LogEntry::txn_delete(
                TransactionId::new(*txn),
                key.as_str(),
                value.as_ref().map(|v| v.as_bytes().to_vec()),
            ),
            Self::Commit { txn } => LogEntry::commit(TransactionId::new(*txn)),
            Self::Abort { txn } => LogEntry::abort(TransactionId::new(*txn)),
        }
    }
}

/// A named replay case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayScenario {
    /// Scenario name.
    pub name: String,
    /// Entries, numbered from LSN 1 in order.
    pub entries: Vec<ScenarioEntry>,
    /// Replay stops after this LSN; `None` replays everything.
    #[serde(default)]
    pub up_to: Option<u64>,
    /// Live pairs expected, sorted by key, values in insertion order.
    pub expected: Vec<(String, String)>,
}

/// What replay produced when it differed from a scenario's expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioMismatch {
    /// Scenario name.
    pub name: String,
    /// Expected pairs.
    pub expected: Vec<(String, String)>,
    /// Pairs replay produced.
    pub actual: Vec<(String, String)>,
}

impl ReplayScenario {
    /// Replays the scenario through a log manager and the recovery engine.
    ///
    /// # Errors
    ///
    /// Returns the replay error if the entries are rejected.
    pub fn replay(&self) -> CoreResult<LiveRecordSet> {
        let log = LogManager::open(Box::new(MemoryStore::new()))?;
        for entry in &self.entries {
            log.append(&entry.to_log_entry())?;
        }
        let outcome = RecoveryEngine::new(&log).replay_up_to(self.up_to.map(Lsn::new))?;
        Ok(outcome.state.into_live())
    }

    /// Replays the scenario and compares the result with `expected`.
    ///
    /// # Errors
    ///
    /// Returns the replay error if the entries are rejected.
    pub fn verify(&self) -> CoreResult<Result<(), ScenarioMismatch>> {
        let live = self.replay()?;
        let actual: Vec<(String, String)> = live
            .iter()
            .map(|(k, v)| {
                (
                    String::from_utf8_lossy(k).into_owned(),
                    String::from_utf8_lossy(v).into_owned(),
                )
            })
            .collect();
        if actual == self.expected {
            Ok(Ok(()))
        } else {
            Ok(Err(ScenarioMismatch {
                name: self.name.clone(),
                expected: self.expected.clone(),
                actual,
            }))
        }
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parses from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

fn put(key: &str, value: &str) -> ScenarioEntry {
    ScenarioEntry::Put {
        key: key.into(),
        value: value.into(),
    }
}

fn txn_put(txn: u64, key: &str, value: &str) -> ScenarioEntry {
    ScenarioEntry::TxnPut {
        txn,
        key: key.into(),
        value: value.into(),
    }
}

fn txn_delete(txn: u64, key: &str, value: Option<&str>) -> ScenarioEntry {
    ScenarioEntry::TxnDelete {
        txn,
        key: key.into(),
        value: value.map(Into::into),
    }
}

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect()
}

fn scenario_a_entries() -> Vec<ScenarioEntry> {
    vec![
        put("k1", "v1"),
        txn_put(1, "k2", "v2"),
        put("k3", "v3"),
        ScenarioEntry::Commit { txn: 1 },
    ]
}

/// Built-in scenarios.
pub fn builtin_scenarios() -> Vec<ReplayScenario> {
    vec![
        ReplayScenario {
            name: "scenario_a_before_commit".into(),
            entries: scenario_a_entries(),
            up_to: Some(3),
            expected: pairs(&[("k1", "v1"), ("k3", "v3")]),
        },
        ReplayScenario {
            name: "scenario_a_full".into(),
            entries: scenario_a_entries(),
            up_to: None,
            expected: pairs(&[("k1", "v1"), ("k2", "v2"), ("k3", "v3")]),
        },
        ReplayScenario {
            name: "abort_discards".into(),
            entries: vec![
                txn_put(1, "k", "v"),
                put("k", "w"),
                ScenarioEntry::Abort { txn: 1 },
            ],
            up_to: None,
            expected: pairs(&[("k", "w")]),
        },
        ReplayScenario {
            name: "delete_before_insert_nets_to_absence".into(),
            entries: vec![
                txn_delete(1, "k", Some("v")),
                txn_put(1, "k", "v"),
                ScenarioEntry::Commit { txn: 1 },
            ],
            up_to: None,
            expected: vec![],
        },
        ReplayScenario {
            name: "key_only_delete_takes_first".into(),
            entries: vec![
                put("k", "a"),
                put("k", "b"),
                put("k", "a"),
                ScenarioEntry::Delete {
                    key: "k".into(),
                    value: None,
                },
                ScenarioEntry::Delete {
                    key: "k".into(),
                    value: Some("a".into()),
                },
            ],
            up_to: None,
            expected: pairs(&[("k", "b")]),
        },
        ReplayScenario {
            name: "unresolved_tail_is_aborted".into(),
            entries: vec![
                put("a", "1"),
                txn_put(1, "b", "2"),
                txn_put(2, "c", "3"),
                ScenarioEntry::Commit { txn: 2 },
            ],
            up_to: None,
            expected: pairs(&[("a", "1"), ("c", "3")]),
        },
        ReplayScenario {
            name: "unknown_resolution_is_ignored".into(),
            entries: vec![ScenarioEntry::Commit { txn: 9 }, put("a", "1")],
            up_to: None,
            expected: pairs(&[("a", "1")]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_scenarios_hold() {
        for scenario in builtin_scenarios() {
            assert_eq!(scenario.verify().unwrap(), Ok(()), "{}", scenario.name);
        }
    }

    #[test]
    fn scenarios_survive_json() {
        for scenario in builtin_scenarios() {
            let json = scenario.to_json().unwrap();
            assert_eq!(ReplayScenario::from_json(&json).unwrap(), scenario);
        }
    }

    #[test]
    fn hand_written_json_parses() {
        let json = r#"{
            "name": "inline",
            "entries": [
                {"kind": "txn_put", "txn": 1, "key": "k", "value": "v"},
                {"kind": "txn_delete", "txn": 1, "key": "k"},
                {"kind": "commit", "txn": 1}
            ],
            "expected": []
        }"#;
        let scenario = ReplayScenario::from_json(json).unwrap();
        assert_eq!(scenario.up_to, None);
        assert_eq!(scenario.verify().unwrap(), Ok(()));
    }

    #[test]
    fn wrong_expectation_is_reported() {
        let mut scenario = builtin_scenarios().remove(1);
        scenario.expected.pop();
        let mismatch = scenario.verify().unwrap().unwrap_err();
        assert_eq!(mismatch.actual.len(), 3);
    }
}
