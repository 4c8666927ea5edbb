//! Piece identifiers.
//!
//! A [`PieceId`] is 32 random bytes naming one logical piece. Every storage
//! node holding a share of that piece knows it under a different identifier,
//! obtained with [`PieceId::derive`]. The derivation is keyed by the original
//! identifier so node-local identifiers cannot be linked back to each other.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;

use crate::node_id::NodeId;

/// Length of a piece identifier in bytes.
pub const PIECE_ID_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum PieceIdError {
    #[error("not enough bytes to make a piece ID; have {have}, need 32")]
    InvalidLength { have: usize },

    #[error("invalid piece ID encoding: {0}")]
    Decode(#[from] data_encoding::DecodeError),

    #[error("random source unavailable: {0}")]
    Random(#[from] rand::Error),

    #[error("piece ID cell must hold a byte blob")]
    InvalidCell,
}

/// Unique identifier of a piece.
///
/// The text form is unpadded base32 with the standard alphabet. The all-zero
/// value means "unset".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceId([u8; PIECE_ID_SIZE]);

impl PieceId {
    /// Generate a new random piece ID.
    ///
    /// # Panics
    ///
    /// Panics if the operating system's random source fails. Use
    /// [`PieceId::try_generate`] to handle that case.
    pub fn generate() -> Self {
        match Self::try_generate() {
            Ok(id) => id,
            Err(err) => panic!("failed to generate piece ID: {err}"),
        }
    }

    /// Generate a new random piece ID, surfacing random source failures.
    pub fn try_generate() -> Result<Self, PieceIdError> {
        let mut bytes = [0u8; PIECE_ID_SIZE];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub const fn new(bytes: [u8; PIECE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse the base32 text form.
    pub fn from_string(s: &str) -> Result<Self, PieceIdError> {
        let bytes = BASE32_NOPAD.decode(s.as_bytes())?;
        Self::from_bytes(&bytes)
    }

    /// Build a piece ID from exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PieceIdError> {
        let array: [u8; PIECE_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| PieceIdError::InvalidLength { have: bytes.len() })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PIECE_ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; PIECE_ID_SIZE]
    }

    /// Derive the identifier `storage_node` uses for share `piece_num` of this piece.
    pub fn derive(&self, storage_node: &NodeId, piece_num: i32) -> PieceId {
        self.deriver().derive(storage_node, piece_num)
    }

    /// Build a reusable deriver keyed by this piece ID.
    pub fn deriver(&self) -> PieceIdDeriver {
        PieceIdDeriver::new(self)
    }

    /// Value stored in a database cell.
    pub fn to_cell(&self) -> Vec<u8> {
        self.to_vec()
    }

    /// Parse a database cell. `None` stands for a NULL or non-blob cell.
    pub fn from_cell(cell: Option<&[u8]>) -> Result<Self, PieceIdError> {
        match cell {
            Some(bytes) => Self::from_bytes(bytes),
            None => Err(PieceIdError::InvalidCell),
        }
    }
}

impl Display for PieceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0))
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({self})")
    }
}

impl FromStr for PieceId {
    type Err = PieceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl TryFrom<&[u8]> for PieceId {
    type Error = PieceIdError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl TryFrom<Vec<u8>> for PieceId {
    type Error = PieceIdError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_bytes(&value)
    }
}

impl AsRef<[u8]> for PieceId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl_id_serde!(PieceId);

/// Keyed derivation of node-specific piece IDs.
///
/// Holds an HMAC-SHA512 keyed by the root piece ID. Every derivation starts
/// from a copy of the keyed MAC, so reusing one deriver gives the same results
/// as building a fresh one per call. `derive` takes `&mut self`; concurrent callers need
/// their own instance.
#[derive(Clone)]
pub struct PieceIdDeriver {
    mac: Hmac<Sha512>,
}

impl PieceIdDeriver {
    fn new(root: &PieceId) -> Self {
        let mac = match <Hmac<Sha512> as KeyInit>::new_from_slice(root.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC accepts keys of any length"),
        };
        Self { mac }
    }

    /// HMAC(root, node_id || big-endian piece_num), truncated to 32 bytes.
    pub fn derive(&mut self, storage_node: &NodeId, piece_num: i32) -> PieceId {
        let mut mac = self.mac.clone();
        mac.update(storage_node.as_bytes());
        mac.update(&piece_num.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let mut derived = [0u8; PIECE_ID_SIZE];
        derived.copy_from_slice(&digest[..PIECE_ID_SIZE]);
        PieceId(derived)
    }
}

impl fmt::Debug for PieceIdDeriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceIdDeriver").finish_non_exhaustive()
    }
}
