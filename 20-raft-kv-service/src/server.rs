//! Request dispatcher: the Get/PutAppend entry points of a replica.
//!
//! A call submits its [`Op`] to the consensus module, registers a wait
//! channel for the index the op was assigned, and waits until the apply loop
//! reports what committed there or the reply timeout expires. The pre-submit
//! leadership check only turns away obvious followers early; the reply is
//! linearizable because it is sent after the op has been applied at its
//! index.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::apply;
use crate::command::Op;
use crate::config::ServerConfig;
use crate::consensus::{ApplyMsg, Consensus};
use crate::dedup::DedupTable;
use crate::error::KvError;
use crate::persister::Persister;
use crate::snapshot;
use crate::store::KvStore;
use crate::waiters::{Ticket, WaitRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetArgs {
    pub key: String,
    pub client_id: i64,
    pub seq_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub client_id: i64,
    pub seq_id: i64,
}

/// Point-in-time view of a replica, for the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub term: u64,
    pub is_leader: bool,
    pub killed: bool,
    pub last_applied: u64,
    pub pending: usize,
    pub store: BTreeMap<String, String>,
}

/// Everything the apply loop mutates, guarded by one lock.
#[derive(Default)]
pub(crate) struct ServerState {
    pub(crate) store: KvStore,
    pub(crate) dedup: DedupTable,
    pub(crate) waiters: WaitRegistry,
    /// Highest log index reflected in `store` and `dedup`.
    pub(crate) last_applied: u64,
}

/// One replica of the key-value service.
pub struct KvServer<C> {
    pub(crate) consensus: Arc<C>,
    pub(crate) state: Mutex<ServerState>,
    pub(crate) config: ServerConfig,
    /// Mirrors `ServerState::last_applied` for callers that wait on replay.
    pub(crate) applied: watch::Sender<u64>,
    dead: AtomicBool,
}

impl<C: Consensus> KvServer<C> {
    /// Builds a replica on top of `consensus` and spawns its apply loop.
    ///
    /// State is restored from the snapshot in `persister` before the apply
    /// loop reads anything from `apply_rx`. A snapshot that fails to decode
    /// aborts startup.
    ///
    /// Must be called from within a Tokio runtime. The returned handle
    /// resolves when the commit stream closes, or with the error that
    /// stopped the replica.
    pub fn start(
        consensus: Arc<C>,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        persister: &dyn Persister,
        config: ServerConfig,
    ) -> Result<(Arc<Self>, JoinHandle<Result<()>>)> {
        let mut state = ServerState::default();
        let raw = persister
            .read_snapshot()
            .context("failed to read snapshot")?;
        if let Some(restored) = snapshot::decode(&raw).context("failed to decode snapshot")? {
            info!(
                last_included_index = restored.last_included_index,
                keys = restored.store.len(),
                clients = restored.dedup.len(),
                "restored state from snapshot"
            );
            state.store = restored.store;
            state.dedup = restored.dedup;
            state.last_applied = restored.last_included_index;
        }

        let (applied, _) = watch::channel(state.last_applied);
        let server = Arc::new(Self {
            consensus,
            state: Mutex::new(state),
            config,
            applied,
            dead: AtomicBool::new(false),
        });
        let apply_loop = tokio::spawn(apply::run(Arc::clone(&server), apply_rx));
        Ok((server, apply_loop))
    }

    pub async fn get(&self, args: GetArgs) -> Result<String, KvError> {
        let op = Op::get(args.client_id, args.seq_id, args.key);
        let committed = self.replicate(op).await?;
        let state = self.lock();
        match state.store.get(&committed.key) {
            Some(value) => Ok(value.to_owned()),
            None => Err(KvError::NoKey),
        }
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> Result<(), KvError> {
        let op = match args.op {
            PutAppendOp::Put => Op::put(args.client_id, args.seq_id, args.key, args.value),
            PutAppendOp::Append => Op::append(args.client_id, args.seq_id, args.key, args.value),
        };
        self.replicate(op).await.map(|_| ())
    }

    /// Marks the replica unavailable and stops the consensus module.
    ///
    /// In-flight calls are left to resolve through their own timeout. The
    /// apply loop exits once the commit stream closes.
    pub fn kill(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            info!("replica killed");
        }
        self.consensus.kill();
    }

    pub fn is_killed(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Highest write `seq_id` applied for `client_id`, including what was
    /// restored from a snapshot or replayed from the log.
    ///
    /// A client that reuses its id across restarts must continue above this
    /// value; anything at or below it is treated as a retry and dropped.
    pub fn last_seq(&self, client_id: i64) -> Option<i64> {
        self.lock().dedup.last_applied(client_id)
    }

    /// Resolves once the apply loop has reached `index`.
    pub async fn wait_applied(&self, index: u64) {
        let mut applied = self.applied.subscribe();
        // The sender lives as long as `self`, so this cannot see a closed
        // channel.
        let _ = applied.wait_for(|&last| last >= index).await;
    }

    pub fn status(&self) -> ServiceStatus {
        let (term, is_leader) = self.consensus.current_state();
        let state = self.lock();
        ServiceStatus {
            term,
            is_leader,
            killed: self.is_killed(),
            last_applied: state.last_applied,
            pending: state.waiters.len(),
            store: state.store.to_map(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits `op` and waits for the apply loop to commit it.
    ///
    /// # Why hold the lock across submit?
    ///
    /// The consensus module may commit and deliver the entry before `submit`
    /// even returns. If the waiter were registered after releasing the lock,
    /// the apply loop could reach that index first, find nobody to notify,
    /// and the call would sit until its timeout. Holding the lock across
    /// `submit` and `register` means the apply loop, which needs the same
    /// lock, can only notify once the waiter exists. `submit` never waits
    /// for the commit itself, so the critical section stays short.
    ///
    /// Returns the committed op only if it is the one submitted here; any
    /// other outcome is a retryable error.
    async fn replicate(&self, op: Op) -> Result<Op, KvError> {
        if self.is_killed() {
            return Err(KvError::WrongLeader);
        }
        let (_, is_leader) = self.consensus.current_state();
        if !is_leader {
            return Err(KvError::WrongLeader);
        }

        let command = op.encode().map_err(|err| {
            error!(error = %err, "failed to encode op");
            KvError::WrongLeader
        })?;

        // Submitting and registering under the lock keeps the apply loop
        // from signalling the index before anyone waits on it.
        let (ticket, rx) = {
            let mut state = self.lock();
            let submission = self.consensus.submit(command);
            if !submission.is_leader {
                return Err(KvError::WrongLeader);
            }
            state.waiters.register(submission.index)
        };
        let _registration = Registration {
            state: &self.state,
            ticket,
        };

        match timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(committed)) if committed.is_same_request(&op) => Ok(committed),
            Ok(Ok(committed)) => {
                debug!(
                    index = ticket.index(),
                    client_id = op.client_id,
                    seq_id = op.seq_id,
                    committed_client_id = committed.client_id,
                    committed_seq_id = committed.seq_id,
                    "a different op committed at our index"
                );
                Err(KvError::WrongLeader)
            }
            // Displaced by a newer registration or abandoned by a snapshot.
            Ok(Err(_)) => Err(KvError::WrongLeader),
            Err(_) => {
                debug!(
                    index = ticket.index(),
                    client_id = op.client_id,
                    seq_id = op.seq_id,
                    "timed out waiting for commit"
                );
                Err(KvError::Timeout)
            }
        }
    }
}

/// Removes a wait-channel registration on every exit path, including a
/// caller dropping the request future.
struct Registration<'a> {
    state: &'a Mutex<ServerState>,
    ticket: Ticket,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .unregister(self.ticket);
    }
}
