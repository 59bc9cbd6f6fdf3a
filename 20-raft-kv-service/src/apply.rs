//! The apply loop: the only writer of the store and the dedup table.
//!
//! It consumes the commit stream strictly in order. Commands are folded
//! into the store through the dedup table and then handed to whichever
//! dispatcher call waits on their index; snapshots replace the whole state
//! when they are newer than what has been applied. After each command the
//! loop checks the persisted log size and compacts the log once it crosses
//! the configured threshold.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::command::{Op, OpKind};
use crate::consensus::{ApplyMsg, Consensus};
use crate::dedup::DedupTable;
use crate::error::SnapshotError;
use crate::server::KvServer;
use crate::snapshot;
use crate::store::KvStore;

/// Applies one committed op to the state machine.
///
/// Returns `true` if the store changed. Gets never mutate; a Put or Append
/// whose `seq_id` is not newer than the client's last applied one is a
/// duplicate and is skipped.
pub fn apply_op(store: &mut KvStore, dedup: &mut DedupTable, op: &Op) -> bool {
    match op.kind {
        OpKind::Get => return false,
        _ if !dedup.is_fresh(op.client_id, op.seq_id) => return false,
        OpKind::Put => store.put(op.key.clone(), op.value.clone()),
        OpKind::Append => store.append(op.key.clone(), &op.value),
    }
    dedup.record(op.client_id, op.seq_id);
    true
}

/// Drains the commit stream until it closes or an entry cannot be applied.
///
/// # Why a single task?
///
/// Exactly-once semantics depend on every replica folding the same entries
/// in the same order. One consumer of the stream makes that order the log
/// order with no further coordination. Dispatcher calls only read the
/// store after their entry is applied, so they never race the fold.
pub(crate) async fn run<C: Consensus>(
    server: Arc<KvServer<C>>,
    mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
) -> Result<()> {
    while let Some(msg) = apply_rx.recv().await {
        let result = match msg {
            ApplyMsg::Command { index, command } => server.apply_command(index, &command),
            ApplyMsg::Snapshot {
                last_included_index,
                data,
            } => server.install_snapshot(last_included_index, &data),
        };
        if let Err(err) = result {
            error!(error = ?err, "apply loop failed, stopping replica");
            server.kill();
            return Err(err);
        }
    }
    info!("commit stream closed, apply loop exiting");
    Ok(())
}

impl<C: Consensus> KvServer<C> {
    fn apply_command(&self, index: u64, command: &[u8]) -> Result<()> {
        let snapshot = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if index <= state.last_applied {
                debug!(index, last_applied = state.last_applied, "skipping redelivered entry");
                return Ok(());
            }
            if index != state.last_applied + 1 {
                bail!(
                    "commit stream skipped from index {} to {}",
                    state.last_applied,
                    index
                );
            }

            let op = Op::decode(command)
                .with_context(|| format!("failed to decode command at index {index}"))?;
            let applied = apply_op(&mut state.store, &mut state.dedup, &op);
            state.last_applied = index;
            self.applied.send_replace(index);
            debug!(
                index,
                client_id = op.client_id,
                seq_id = op.seq_id,
                kind = ?op.kind,
                applied,
                "applied command"
            );
            state.waiters.notify(index, op);

            let log_size = self.consensus.persisted_log_size();
            if self.config.should_snapshot(log_size) {
                debug!(index, log_size, "log over threshold, taking snapshot");
                Some(
                    snapshot::encode(&state.store, &state.dedup, index)
                        .with_context(|| format!("failed to encode snapshot at index {index}"))?,
                )
            } else {
                None
            }
        };

        if let Some(bytes) = snapshot {
            self.consensus.compact(index, bytes);
        }
        Ok(())
    }

    fn install_snapshot(&self, last_included_index: u64, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if last_included_index <= state.last_applied {
            debug!(
                last_included_index,
                last_applied = state.last_applied,
                "ignoring stale snapshot"
            );
            return Ok(());
        }

        let Some(restored) = snapshot::decode(data)
            .with_context(|| format!("failed to decode snapshot at index {last_included_index}"))?
        else {
            bail!("empty snapshot delivered for index {last_included_index}");
        };
        if restored.last_included_index != last_included_index {
            return Err(SnapshotError::IndexMismatch {
                claimed: restored.last_included_index,
                delivered: last_included_index,
            }
            .into());
        }

        state.store = restored.store;
        state.dedup = restored.dedup;
        state.last_applied = last_included_index;
        self.applied.send_replace(last_included_index);
        let abandoned = state.waiters.abandon_through(last_included_index);
        info!(last_included_index, abandoned, "installed snapshot");
        Ok(())
    }
}
