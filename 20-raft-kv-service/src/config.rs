use std::time::Duration;

/// How long a dispatcher call waits for its entry to commit.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Runtime settings for a [`crate::server::KvServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Snapshot once the persisted log grows past this many bytes. `None`
    /// disables snapshots.
    pub max_raft_state: Option<usize>,
    pub reply_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_raft_state: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn with_max_raft_state(mut self, bytes: usize) -> Self {
        self.max_raft_state = Some(bytes);
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Whether a log of `log_size` bytes should be compacted. A log exactly
    /// at the limit is still within it.
    pub fn should_snapshot(&self, log_size: usize) -> bool {
        matches!(self.max_raft_state, Some(limit) if log_size > limit)
    }
}
