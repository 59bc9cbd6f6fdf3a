//! Linearizable key-value service layered on a replicated log.
//!
//! Clients call [`server::KvServer::get`] and
//! [`server::KvServer::put_append`]. Each call becomes an [`command::Op`]
//! submitted to a consensus module; the replica answers once that op has
//! been committed and applied at the index it was assigned, or gives up
//! after a timeout. Retried requests are made idempotent by a per-client
//! sequence table, and the replicated log is kept small by snapshotting the
//! whole state machine once it grows past a threshold.
//!
//! # Architecture
//!
//! - **Dispatcher** (any number of concurrent calls): checks leadership,
//!   submits, waits on a one-shot channel with a timeout.
//! - **Apply loop** (one Tokio task): consumes the commit stream in order,
//!   applies commands exactly once, wakes the matching dispatcher call,
//!   installs snapshots and triggers compaction.
//!
//! The store, the dedup table and the wait registry sit behind one mutex
//! that is never held across an `.await`.
//!
//! # Modules
//!
//! - [`server`]: the replica and its Get/PutAppend entry points
//! - [`apply`]: the apply loop and the pure `apply_op` fold
//! - [`store`], [`dedup`], [`waiters`]: state guarded by the replica lock
//! - [`snapshot`]: snapshot codec
//! - [`consensus`]: what the service needs from the replicated log
//! - [`local_log`]: single-replica log implementing [`consensus::Consensus`]
//! - [`persister`]: durable storage for log state and snapshots
//! - [`command`]: the replicated operation
//! - [`config`], [`error`], [`protocol`]: settings, errors, console parsing

pub mod apply;
mod codec;
pub mod command;
pub mod config;
pub mod consensus;
pub mod dedup;
pub mod error;
pub mod local_log;
pub mod persister;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod waiters;
