//! Error types for the key-value service.

use std::io;

/// Outcome of a client call that did not succeed.
///
/// `Ok(..)` on the call's `Result` plays the role of the `OK` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// Get against a key that is absent from the store.
    #[error("no such key")]
    NoKey,
    /// This replica cannot serve the request; try another one.
    #[error("not the leader")]
    WrongLeader,
    /// The outcome is unknown. Retrying with the same sequence number is safe.
    #[error("timed out waiting for the operation to commit")]
    Timeout,
}

impl KvError {
    pub fn is_retryable(self) -> bool {
        matches!(self, KvError::WrongLeader | KvError::Timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("corrupt snapshot: {0}")]
    Corrupt(#[from] bincode::Error),
    #[error("snapshot claims index {claimed} but was delivered for index {delivered}")]
    IndexMismatch { claimed: u64, delivered: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persister I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("persisted log is corrupt: {0}")]
    Codec(#[from] bincode::Error),
}
