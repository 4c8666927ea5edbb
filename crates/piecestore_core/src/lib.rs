//! Core types shared by the piece store: piece identities, node identities,
//! order limits, piece hashes, signing and the retain filter format.

/// Serde support for 32-byte identifiers.
///
/// Human-readable formats get the `Display`/`FromStr` text, binary formats get
/// the raw bytes.
macro_rules! impl_id_serde {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.collect_str(self)
                } else {
                    serde::Serialize::serialize(&self.0, serializer)
                }
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let text = <String as serde::Deserialize>::deserialize(deserializer)?;
                    text.parse().map_err(serde::de::Error::custom)
                } else {
                    <[u8; 32] as serde::Deserialize>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

pub mod bloom;
pub mod encoding;
pub mod hash;
pub mod node_id;
pub mod order;
pub mod piece_id;
pub mod signing;

pub use hash::{HashAlgorithm, PieceHasher};
pub use node_id::NodeId;
pub use order::{Order, OrderLimit, PieceAction, PieceHash, SerialNumber};
pub use piece_id::{PieceId, PieceIdDeriver, PieceIdError};
pub use signing::{Identity, Signable, SigningError};
