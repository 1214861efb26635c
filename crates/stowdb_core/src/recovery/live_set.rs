//! The live record set.

use std::collections::BTreeMap;

/// The `(key, value)` pairs a consistent reader observes.
///
/// Keys are ordered; each key holds its values in insertion order, and the
/// same value may appear more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveRecordSet {
    records: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
    len: usize,
}

impl LiveRecordSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pair. Duplicates are kept.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.records.entry(key).or_default().push(value);
        self.len += 1;
    }

    /// Removes one matching record.
    ///
    /// With `Some(value)` the first occurrence of that exact pair goes; with
    /// `None` the first record stored under `key` goes. Returns whether a
    /// record was removed.
    pub fn remove(&mut self, key: &[u8], value: Option<&[u8]>) -> bool {
        let Some(values) = self.records.get_mut(key) else {
            return false;
        };
        let position = match value {
            Some(value) => values.iter().position(|v| v == value),
            None => (!values.is_empty()).then_some(0),
        };
        let Some(position) = position else {
            return false;
        };
        values.remove(position);
        if values.is_empty() {
            self.records.remove(key);
        }
        self.len -= 1;
        true
    }

    /// Values stored under `key`, oldest first.
    #[must_use]
    pub fn values(&self, key: &[u8]) -> &[Vec<u8>] {
        self.records.get(key).map_or(&[], Vec::as_slice)
    }

    /// Whether the exact pair is present.
    #[must_use]
    pub fn contains(&self, key: &[u8], value: &[u8]) -> bool {
        self.values(key).iter().any(|v| v == value)
    }

    /// Whether any record is stored under `key`.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.records.contains_key(key)
    }

    /// Number of records, counting duplicates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over every pair in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.records
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_slice(), v.as_slice())))
    }

    /// Copies every pair out, in key order.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect()
    }
}

impl<K, V> FromIterator<(K, V)> for LiveRecordSet
where
    K: Into<Vec<u8>>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k.into(), v.into());
        }
        set
    }
}
