//! In-memory key-value map replicated by the service.
//!
//! This is the application state machine: the data every replica converges
//! on by applying the same committed operations in the same order. It holds
//! no lock of its own; the server keeps it behind the same mutex as the
//! dedup table and the wait registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The replicated map.
///
/// # Why BTreeMap instead of HashMap?
///
/// Replicas that applied the same commands must produce the same snapshot
/// bytes. `HashMap` iteration order is randomized per process, so two equal
/// stores could serialize differently. `BTreeMap` iterates in key order,
/// which also keeps `STATUS` output sorted. The dedup table uses a
/// `BTreeMap` for the same reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    /// Creates an empty key-value store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Appends to the current value. An absent key behaves like an empty one.
    pub fn append(&mut self, key: String, value: &str) {
        self.data.entry(key).or_default().push_str(value);
    }

    /// Retrieves the current value for a key.
    ///
    /// `None` means the key is absent. `Some("")` is a stored empty string.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Clones the map out, for status displays.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_overwrites() {
        let mut store = KvStore::new();
        store.put("a".into(), "1".into());
        store.put("a".into(), "2".into());
        assert_eq!(store.get("a"), Some("2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_concatenates_and_creates() {
        let mut store = KvStore::new();
        store.append("a".into(), "x");
        store.append("a".into(), "y");
        assert_eq!(store.get("a"), Some("xy"));
    }

    #[test]
    fn empty_value_is_present() {
        let mut store = KvStore::new();
        store.put("blank".into(), String::new());
        assert_eq!(store.get("blank"), Some(""));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn iteration_is_ordered() {
        let mut store = KvStore::new();
        store.put("b".into(), "2".into());
        store.put("a".into(), "1".into());
        let keys: Vec<&str> = store.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
