//! Per-client record of the last applied request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Highest applied sequence number for each client.
///
/// Values only ever grow. A request whose `seq_id` is at or below the
/// recorded value has already taken effect and must not mutate the store
/// again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupTable {
    last_seq: BTreeMap<i64, i64>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `seq_id` has not been applied for `client_id` yet.
    pub fn is_fresh(&self, client_id: i64, seq_id: i64) -> bool {
        match self.last_seq.get(&client_id) {
            Some(&last) => seq_id > last,
            None => true,
        }
    }

    /// Records `seq_id` as applied. Never moves a client backwards.
    pub fn record(&mut self, client_id: i64, seq_id: i64) {
        let last = self.last_seq.entry(client_id).or_insert(seq_id);
        if seq_id > *last {
            *last = seq_id;
        }
    }

    pub fn last_applied(&self, client_id: i64) -> Option<i64> {
        self.last_seq.get(&client_id).copied()
    }

    pub fn len(&self) -> usize {
        self.last_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_client_is_fresh() {
        let table = DedupTable::new();
        assert!(table.is_fresh(7, 1));
        assert!(table.is_fresh(7, 0));
        assert_eq!(table.last_applied(7), None);
    }

    #[test]
    fn applied_and_older_sequences_are_duplicates() {
        let mut table = DedupTable::new();
        table.record(7, 3);
        assert!(!table.is_fresh(7, 1));
        assert!(!table.is_fresh(7, 3));
        assert!(table.is_fresh(7, 4));
        assert!(table.is_fresh(8, 1));
    }

    #[test]
    fn record_never_regresses() {
        let mut table = DedupTable::new();
        table.record(1, 5);
        table.record(1, 2);
        assert_eq!(table.last_applied(1), Some(5));
        table.record(1, 9);
        assert_eq!(table.last_applied(1), Some(9));
        assert_eq!(table.len(), 1);
    }
}
