//! Wait-channel registry: log index -> one-shot notification.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::command::Op;

/// Identifies one registration, so a stale waiter cannot remove a newer one
/// that took over the same index.
///
/// # Why generations?
///
/// After a leadership change the same index can be handed out twice: once
/// to a call on the old term that is still waiting, and again to a new
/// call. The second registration displaces the first. When the first call
/// then times out, its cleanup must not remove the second one's channel.
/// The index alone cannot tell them apart; the generation can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    index: u64,
    generation: u64,
}

impl Ticket {
    pub fn index(&self) -> u64 {
        self.index
    }
}

struct Waiter {
    generation: u64,
    tx: oneshot::Sender<Op>,
}

/// Pending dispatcher calls, keyed by the log index they wait on.
#[derive(Default)]
pub struct WaitRegistry {
    pending: HashMap<u64, Waiter>,
    next_generation: u64,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `index`.
    ///
    /// A previous registration for the same index is displaced; its receiver
    /// sees the channel close and its caller reports a retryable error.
    pub fn register(&mut self, index: u64) -> (Ticket, oneshot::Receiver<Op>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(index, Waiter { generation, tx });
        (Ticket { index, generation }, rx)
    }

    /// Hands `op` to whoever waits on `index`, removing the registration.
    ///
    /// Never blocks. Returns `false` when nobody was waiting or the waiter
    /// already gave up.
    pub fn notify(&mut self, index: u64, op: Op) -> bool {
        match self.pending.remove(&index) {
            Some(waiter) => waiter.tx.send(op).is_ok(),
            None => false,
        }
    }

    /// Removes the registration behind `ticket`, if it is still the current one.
    pub fn unregister(&mut self, ticket: Ticket) {
        if let Some(waiter) = self.pending.get(&ticket.index) {
            if waiter.generation == ticket.generation {
                self.pending.remove(&ticket.index);
            }
        }
    }

    /// Drops every waiter at or below `index`.
    ///
    /// Used when a snapshot jumps past those indexes: the committed commands
    /// are folded into the snapshot and cannot be matched against the
    /// waiters any more. Their callers see a closed channel.
    pub fn abandon_through(&mut self, index: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|&pending, _| pending > index);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
