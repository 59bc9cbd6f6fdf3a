//! Snapshot codec.
//!
//! A snapshot bundles the store, the dedup table and the index of the last
//! log entry whose effects they contain. The consensus module treats the
//! encoded bytes as an opaque blob; only this module interprets them.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::dedup::DedupTable;
use crate::error::SnapshotError;
use crate::store::KvStore;

/// Decoded snapshot contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    pub store: KvStore,
    pub dedup: DedupTable,
    pub last_included_index: u64,
}

// Field order must match `Snapshot`; bincode is positional.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    store: &'a KvStore,
    dedup: &'a DedupTable,
    last_included_index: u64,
}

/// Serializes the state machine without cloning it.
pub fn encode(
    store: &KvStore,
    dedup: &DedupTable,
    last_included_index: u64,
) -> Result<Vec<u8>, SnapshotError> {
    let snapshot = SnapshotRef {
        store,
        dedup,
        last_included_index,
    };
    Ok(codec::serialize(&snapshot)?)
}

/// Decodes a snapshot.
///
/// Empty input means there is no snapshot and yields `Ok(None)`. Anything
/// else must decode completely; partial state is never returned.
pub fn decode(bytes: &[u8]) -> Result<Option<Snapshot>, SnapshotError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(codec::deserialize(bytes)?))
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        encode(&self.store, &self.dedup, self.last_included_index)
    }
}
