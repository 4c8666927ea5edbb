//! Canonical binary encoding used for wire frames, signatures and headers.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Little-endian, fixed-width integers, trailing bytes rejected.
pub fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

pub fn serialize<T: Serialize + ?Sized>(value: &T) -> bincode::Result<Vec<u8>> {
    options().serialize(value)
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> bincode::Result<T> {
    options().deserialize(bytes)
}
