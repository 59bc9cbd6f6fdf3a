//! bincode settings shared by everything this crate writes to the log or to
//! disk.
//!
//! The layout matches `bincode::serialize` (little endian, fixed-width
//! integers) but decoding insists on consuming the whole input.
//!
//! # Why reject trailing bytes?
//!
//! `bincode::deserialize` stops as soon as the value is complete and
//! ignores whatever follows. A snapshot or command with garbage appended
//! would then decode as valid. Anything that is not exactly one encoded
//! value is treated as corrupt.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

pub(crate) fn serialize<T: Serialize + ?Sized>(value: &T) -> bincode::Result<Vec<u8>> {
    options().serialize(value)
}

pub(crate) fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> bincode::Result<T> {
    options().deserialize(bytes)
}
