//! Operations that flow through the replicated log.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::CommandError;

/// What an [`Op`] does once it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

/// A single client request, as submitted to the consensus module.
///
/// Every dispatcher call builds exactly one of these. `(client_id, seq_id)`
/// identifies the request across retries; the apply loop uses it for
/// deduplication and the dispatcher uses it to recognise its own entry when
/// the wait channel fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub client_id: i64,
    pub seq_id: i64,
    pub key: String,
    pub value: String,
    pub kind: OpKind,
}

impl Op {
    pub fn get(client_id: i64, seq_id: i64, key: impl Into<String>) -> Self {
        Self {
            client_id,
            seq_id,
            key: key.into(),
            value: String::new(),
            kind: OpKind::Get,
        }
    }

    pub fn put(client_id: i64, seq_id: i64, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            client_id,
            seq_id,
            key: key.into(),
            value: value.into(),
            kind: OpKind::Put,
        }
    }

    pub fn append(
        client_id: i64,
        seq_id: i64,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            client_id,
            seq_id,
            key: key.into(),
            value: value.into(),
            kind: OpKind::Append,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        Ok(codec::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        Ok(codec::deserialize(bytes)?)
    }

    /// Whether `other` is the same client request as `self`.
    ///
    /// The value is left out: a retried request carries the same identity
    /// even if the caller rebuilt it.
    pub fn is_same_request(&self, other: &Op) -> bool {
        self.client_id == other.client_id
            && self.seq_id == other.seq_id
            && self.kind == other.kind
            && self.key == other.key
    }

    pub fn mutates(&self) -> bool {
        !matches!(self.kind, OpKind::Get)
    }
}
