//! Piece content hashing.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Algorithm used to hash piece contents. Chosen by the uploader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn hasher(self) -> PieceHasher {
        match self {
            HashAlgorithm::Sha256 => PieceHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => PieceHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Hash `data` in one call.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha256"),
            HashAlgorithm::Blake3 => f.write_str("blake3"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(format!("unknown hash algorithm `{other}`")),
        }
    }
}

/// Running hash over a piece's payload.
pub enum PieceHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl PieceHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            PieceHasher::Sha256(hasher) => hasher.update(data),
            PieceHasher::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            PieceHasher::Sha256(hasher) => hasher.finalize().to_vec(),
            PieceHasher::Blake3(hasher) => hasher.finalize().as_bytes().to_vec(),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            PieceHasher::Sha256(_) => HashAlgorithm::Sha256,
            PieceHasher::Blake3(_) => HashAlgorithm::Blake3,
        }
    }
}
