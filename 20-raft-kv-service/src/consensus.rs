//! The interface this service needs from the consensus module.
//!
//! Leader election, replication and commit-index advancement live behind
//! [`Consensus`]. The service only submits opaque commands, asks who leads,
//! consumes the commit stream in order, and tells the log when it may drop a
//! prefix.

/// One entry on the commit stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed command at `index`.
    Command { index: u64, command: Vec<u8> },
    /// Install `data` as the state up to and including `last_included_index`.
    Snapshot {
        last_included_index: u64,
        data: Vec<u8>,
    },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } => *index,
            ApplyMsg::Snapshot {
                last_included_index,
                ..
            } => *last_included_index,
        }
    }
}

/// Result of handing a command to the consensus module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Index the command will occupy if it commits.
    pub index: u64,
    pub term: u64,
    pub is_leader: bool,
}

/// A replicated log as seen from the state machine.
///
/// Methods are synchronous and are called from Tokio worker threads, so
/// every one of them must return promptly.
pub trait Consensus: Send + Sync + 'static {
    /// Appends `command` to the log if this replica leads. Does not wait for
    /// the entry to commit.
    ///
    /// The dispatcher calls this while holding the service lock, so it must
    /// not block on the network, on other replicas or on anything that
    /// takes that lock. Appending to a local durable log is the only I/O it
    /// may do. Replication to peers belongs on the module's own tasks.
    fn submit(&self, command: Vec<u8>) -> Submission;

    /// Current `(term, is_leader)`.
    fn current_state(&self) -> (u64, bool);

    /// Lets the log discard every entry at or before `up_to_index`, keeping
    /// `snapshot` as the new starting state.
    fn compact(&self, up_to_index: u64, snapshot: Vec<u8>);

    /// Size in bytes of the persisted log state.
    fn persisted_log_size(&self) -> usize;

    /// Stops the module. Its commit stream closes afterwards.
    fn kill(&self);
}
