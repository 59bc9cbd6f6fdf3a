//! Single-replica log that stands in for a consensus cluster.
//!
//! With one replica every appended entry is immediately committed, so
//! `LocalLog` delivers each submitted command straight onto the commit
//! stream. It persists its entries through a [`Persister`], honours
//! compaction, and on reopen replays the entries that follow the last
//! snapshot. It never elects or replicates anything.
//!
//! The fault-injection methods (`set_leader`, `hold_commits`,
//! `replace_held`, `install_snapshot`) reproduce what a real cluster can do
//! to a replica: lose leadership, delay commits, commit a different command
//! at an index after a leadership change, or ship a snapshot to a lagging
//! follower.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::consensus::{ApplyMsg, Consensus, Submission};
use crate::error::PersistError;
use crate::persister::Persister;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    index: u64,
    term: u64,
    command: Vec<u8>,
}

/// What survives a restart.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DurableLog {
    term: u64,
    snapshot_index: u64,
    entries: Vec<LogEntry>,
}

impl DurableLog {
    fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.index)
            .unwrap_or(self.snapshot_index)
    }
}

struct LogState {
    log: DurableLog,
    is_leader: bool,
    /// Highest index already handed to the commit stream.
    commit_index: u64,
    hold_commits: bool,
    apply_tx: Option<mpsc::UnboundedSender<ApplyMsg>>,
}

impl LogState {
    fn send(&mut self, msg: ApplyMsg) {
        let Some(tx) = &self.apply_tx else {
            return;
        };
        if tx.send(msg).is_err() {
            debug!("commit stream receiver dropped");
            self.apply_tx = None;
        }
    }

    /// Pushes every not-yet-delivered entry onto the commit stream.
    fn deliver_pending(&mut self) {
        let pending: Vec<ApplyMsg> = self
            .log
            .entries
            .iter()
            .filter(|entry| entry.index > self.commit_index)
            .map(|entry| ApplyMsg::Command {
                index: entry.index,
                command: entry.command.clone(),
            })
            .collect();
        for msg in pending {
            self.commit_index = msg.index();
            self.send(msg);
        }
    }
}

/// In-process [`Consensus`] implementation for a single replica.
pub struct LocalLog {
    state: Mutex<LogState>,
    persister: Arc<dyn Persister>,
}

impl LocalLog {
    /// Opens the log stored in `persister` and returns it with its commit
    /// stream.
    ///
    /// Entries after the last snapshot are queued on the stream right away,
    /// so a restarted state machine catches up by replaying them on top of
    /// the snapshot. The replica starts as leader of a new term.
    pub fn open(
        persister: Arc<dyn Persister>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ApplyMsg>)> {
        let raw = persister
            .read_raft_state()
            .context("failed to read persisted log")?;
        let mut log: DurableLog = if raw.is_empty() {
            DurableLog::default()
        } else {
            codec::deserialize(&raw).context("persisted log is corrupt")?
        };
        log.term += 1;

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let mut state = LogState {
            commit_index: log.snapshot_index,
            log,
            is_leader: true,
            hold_commits: false,
            apply_tx: Some(apply_tx),
        };
        persist(persister.as_ref(), &state.log).context("failed to persist new term")?;

        info!(
            term = state.log.term,
            snapshot_index = state.log.snapshot_index,
            replay = state.log.entries.len(),
            "local log opened"
        );
        state.deliver_pending();

        let log = Arc::new(Self {
            state: Mutex::new(state),
            persister,
        });
        Ok((log, apply_rx))
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grants or revokes leadership. Gaining it starts a new term.
    pub fn set_leader(&self, is_leader: bool) {
        let mut state = self.state();
        if is_leader && !state.is_leader {
            state.log.term += 1;
            if let Err(err) = persist(self.persister.as_ref(), &state.log) {
                error!(error = %err, "failed to persist term change");
            }
        }
        state.is_leader = is_leader;
        info!(term = state.log.term, is_leader, "leadership changed");
    }

    /// Stops delivering new entries until [`LocalLog::release_commits`].
    pub fn hold_commits(&self) {
        self.state().hold_commits = true;
    }

    /// Resumes delivery, first flushing everything held back.
    pub fn release_commits(&self) {
        let mut state = self.state();
        state.hold_commits = false;
        state.deliver_pending();
    }

    /// Overwrites a held (uncommitted) entry, as a new leader would when it
    /// replaces a deposed leader's log suffix. Returns `false` if `index` is
    /// already committed or does not exist.
    pub fn replace_held(&self, index: u64, command: Vec<u8>) -> bool {
        let mut state = self.state();
        if index <= state.commit_index {
            return false;
        }
        let Some(position) = state.log.entries.iter().position(|e| e.index == index) else {
            return false;
        };
        state.log.term += 1;
        let term = state.log.term;
        let entry = &mut state.log.entries[position];
        entry.command = command;
        entry.term = term;
        if let Err(err) = persist(self.persister.as_ref(), &state.log) {
            error!(error = %err, index, "failed to persist replaced entry");
        }
        true
    }

    /// Delivers a snapshot the way a leader catches up a lagging follower.
    ///
    /// Entries covered by the snapshot are dropped. A snapshot that is not
    /// newer than the current one is ignored.
    pub fn install_snapshot(&self, last_included_index: u64, data: Vec<u8>) {
        let mut state = self.state();
        if last_included_index <= state.log.snapshot_index {
            debug!(
                last_included_index,
                snapshot_index = state.log.snapshot_index,
                "ignoring stale snapshot"
            );
            return;
        }
        state.log.entries.retain(|entry| entry.index > last_included_index);
        state.log.snapshot_index = last_included_index;
        state.commit_index = state.commit_index.max(last_included_index);
        if let Err(err) = persist_with_snapshot(self.persister.as_ref(), &state.log, data.clone())
        {
            error!(error = %err, last_included_index, "failed to persist installed snapshot");
        }
        state.send(ApplyMsg::Snapshot {
            last_included_index,
            data,
        });
    }

    /// Pushes an arbitrary entry onto the commit stream, bypassing the log.
    ///
    /// Models redelivery across a crash boundary, which the state machine
    /// must tolerate.
    pub fn redeliver(&self, msg: ApplyMsg) {
        self.state().send(msg);
    }

    pub fn commit_index(&self) -> u64 {
        self.state().commit_index
    }

    pub fn last_index(&self) -> u64 {
        self.state().log.last_index()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.state().log.snapshot_index
    }

    pub fn retained_entries(&self) -> usize {
        self.state().log.entries.len()
    }
}

impl Consensus for LocalLog {
    fn submit(&self, command: Vec<u8>) -> Submission {
        let mut state = self.state();
        let term = state.log.term;
        if !state.is_leader || state.apply_tx.is_none() {
            return Submission {
                index: 0,
                term,
                is_leader: false,
            };
        }

        let index = state.log.last_index() + 1;
        state.log.entries.push(LogEntry {
            index,
            term,
            command,
        });
        if let Err(err) = persist(self.persister.as_ref(), &state.log) {
            error!(error = %err, index, "failed to persist entry, refusing it");
            state.log.entries.pop();
            return Submission {
                index: 0,
                term,
                is_leader: false,
            };
        }

        if !state.hold_commits {
            state.deliver_pending();
        }
        Submission {
            index,
            term,
            is_leader: true,
        }
    }

    fn current_state(&self) -> (u64, bool) {
        let state = self.state();
        (state.log.term, state.is_leader && state.apply_tx.is_some())
    }

    fn compact(&self, up_to_index: u64, snapshot: Vec<u8>) {
        let mut state = self.state();
        if up_to_index <= state.log.snapshot_index {
            return;
        }
        if up_to_index > state.commit_index {
            warn!(
                up_to_index,
                commit_index = state.commit_index,
                "refusing to compact past the commit index"
            );
            return;
        }
        state.log.entries.retain(|entry| entry.index > up_to_index);
        state.log.snapshot_index = up_to_index;
        match persist_with_snapshot(self.persister.as_ref(), &state.log, snapshot) {
            Ok(size) => debug!(up_to_index, raft_state_size = size, "log compacted"),
            Err(err) => error!(error = %err, up_to_index, "failed to persist compacted log"),
        }
    }

    fn persisted_log_size(&self) -> usize {
        self.persister.raft_state_size()
    }

    fn kill(&self) {
        let mut state = self.state();
        state.is_leader = false;
        state.apply_tx = None;
    }
}

fn persist(persister: &dyn Persister, log: &DurableLog) -> Result<usize, PersistError> {
    let bytes = codec::serialize(log)?;
    let size = bytes.len();
    persister.save_raft_state(bytes)?;
    Ok(size)
}

fn persist_with_snapshot(
    persister: &dyn Persister,
    log: &DurableLog,
    snapshot: Vec<u8>,
) -> Result<usize, PersistError> {
    let bytes = codec::serialize(log)?;
    let size = bytes.len();
    persister.save_state_and_snapshot(bytes, snapshot)?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::MemoryPersister;

    fn open(persister: &MemoryPersister) -> (Arc<LocalLog>, mpsc::UnboundedReceiver<ApplyMsg>) {
        LocalLog::open(Arc::new(persister.clone())).expect("open local log")
    }

    #[test]
    fn submit_commits_in_order() {
        let persister = MemoryPersister::new();
        let (log, mut rx) = open(&persister);

        let first = log.submit(b"a".to_vec());
        let second = log.submit(b"b".to_vec());
        assert_eq!((first.index, second.index), (1, 2));
        assert!(first.is_leader && second.is_leader);

        assert_eq!(
            rx.try_recv().unwrap(),
            ApplyMsg::Command {
                index: 1,
                command: b"a".to_vec()
            }
        );
        assert_eq!(rx.try_recv().unwrap().index(), 2);
        assert!(persister.raft_state_size() > 0);
    }

    #[test]
    fn follower_refuses_submissions() {
        let (log, mut rx) = open(&MemoryPersister::new());
        log.set_leader(false);
        let submission = log.submit(b"a".to_vec());
        assert!(!submission.is_leader);
        assert!(rx.try_recv().is_err());
        assert!(!log.current_state().1);
    }

    #[test]
    fn held_entries_are_delivered_on_release() {
        let (log, mut rx) = open(&MemoryPersister::new());
        log.hold_commits();
        log.submit(b"a".to_vec());
        assert!(rx.try_recv().is_err());
        assert_eq!(log.commit_index(), 0);

        assert!(log.replace_held(1, b"z".to_vec()));
        log.release_commits();
        assert_eq!(
            rx.try_recv().unwrap(),
            ApplyMsg::Command {
                index: 1,
                command: b"z".to_vec()
            }
        );
        assert!(!log.replace_held(1, b"y".to_vec()));
    }

    #[test]
    fn compaction_drops_prefix_and_shrinks_state() {
        let persister = MemoryPersister::new();
        let (log, _rx) = open(&persister);
        for i in 0..10u8 {
            log.submit(vec![i; 64]);
        }
        let before = log.persisted_log_size();
        log.compact(8, b"snap".to_vec());
        assert_eq!(log.snapshot_index(), 8);
        assert_eq!(log.retained_entries(), 2);
        assert!(log.persisted_log_size() < before);
        assert_eq!(persister.read_snapshot().unwrap(), b"snap".to_vec());

        // Older or equal indexes are no-ops.
        log.compact(5, b"old".to_vec());
        assert_eq!(persister.read_snapshot().unwrap(), b"snap".to_vec());
    }

    #[test]
    fn compaction_past_commit_index_is_refused() {
        let (log, _rx) = open(&MemoryPersister::new());
        log.hold_commits();
        log.submit(b"a".to_vec());
        log.compact(1, b"snap".to_vec());
        assert_eq!(log.snapshot_index(), 0);
    }

    #[test]
    fn reopen_replays_suffix_after_snapshot() {
        let persister = MemoryPersister::new();
        {
            let (log, _rx) = open(&persister);
            for i in 0..5u8 {
                log.submit(vec![i]);
            }
            log.compact(3, b"snap".to_vec());
            log.kill();
        }

        let (log, mut rx) = open(&persister);
        let replayed: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|msg| msg.index())
            .collect();
        assert_eq!(replayed, vec![4, 5]);
        assert_eq!(log.submit(vec![9]).index, 6);
        assert_eq!(log.current_state().0, 2);
    }

    #[test]
    fn kill_closes_the_stream() {
        let (log, mut rx) = open(&MemoryPersister::new());
        log.kill();
        assert!(!log.submit(b"a".to_vec()).is_leader);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn stale_snapshot_install_is_ignored() {
        let (log, mut rx) = open(&MemoryPersister::new());
        log.install_snapshot(4, b"four".to_vec());
        log.install_snapshot(2, b"two".to_vec());
        assert_eq!(rx.try_recv().unwrap().index(), 4);
        assert!(rx.try_recv().is_err());
        assert_eq!(log.submit(b"next".to_vec()).index, 5);
    }
}
