//! Bloom filter format for retain requests.
//!
//! Encoded as `[version][hash_count][seed][table...]`. Piece IDs are already
//! uniformly random, so the `k`-th hash is the little-endian `u64` read from
//! the ID at offset `(seed + k) % 25`.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::piece_id::{PieceId, PIECE_ID_SIZE};

pub const FILTER_VERSION: u8 = 1;

const WINDOW: usize = 8;
const WINDOW_OFFSETS: usize = PIECE_ID_SIZE - WINDOW + 1;
const HEADER_SIZE: usize = 3;
const MAX_HASH_COUNT: u8 = 32;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("Filter too short: {0} bytes")]
    TooShort(usize),

    #[error("Unsupported filter version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid hash count {0}")]
    InvalidHashCount(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    seed: u8,
    hash_count: u8,
    table: Vec<u8>,
}

impl BloomFilter {
    /// Size a filter for `expected_elements` at the given false positive rate.
    pub fn new(expected_elements: usize, false_positive_rate: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let bits = (-n * p.ln() / (ln2 * ln2)).ceil().max(8.0);
        let hash_count = ((bits / n) * ln2).round().clamp(1.0, MAX_HASH_COUNT as f64) as u8;
        let bytes = (bits / 8.0).ceil() as usize;

        let seed = (OsRng.next_u32() % WINDOW_OFFSETS as u32) as u8;
        Self::with_parameters(seed, hash_count, bytes)
    }

    pub fn with_parameters(seed: u8, hash_count: u8, size_bytes: usize) -> Self {
        Self {
            seed,
            hash_count: hash_count.clamp(1, MAX_HASH_COUNT),
            table: vec![0; size_bytes.max(1)],
        }
    }

    pub fn add(&mut self, piece_id: &PieceId) {
        for bit in self.bit_positions(piece_id) {
            self.table[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn contains(&self, piece_id: &PieceId) -> bool {
        self.bit_positions(piece_id)
            .all(|bit| self.table[bit / 8] & (1 << (bit % 8)) != 0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.table.len());
        bytes.push(FILTER_VERSION);
        bytes.push(self.hash_count);
        bytes.push(self.seed);
        bytes.extend_from_slice(&self.table);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomError> {
        if bytes.len() <= HEADER_SIZE {
            return Err(BloomError::TooShort(bytes.len()));
        }

        let (version, hash_count, seed) = (bytes[0], bytes[1], bytes[2]);
        if version != FILTER_VERSION {
            return Err(BloomError::UnsupportedVersion(version));
        }
        if hash_count == 0 || hash_count > MAX_HASH_COUNT {
            return Err(BloomError::InvalidHashCount(hash_count));
        }

        Ok(Self {
            seed,
            hash_count,
            table: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    fn bit_positions(&self, piece_id: &PieceId) -> impl Iterator<Item = usize> {
        let bits = (self.table.len() * 8) as u64;
        let seed = self.seed as usize;
        let id = *piece_id.as_bytes();
        (0..self.hash_count as usize).map(move |k| {
            let offset = (seed + k) % WINDOW_OFFSETS;
            let mut window = [0u8; WINDOW];
            window.copy_from_slice(&id[offset..offset + WINDOW]);
            (u64::from_le_bytes(window) % bits) as usize
        })
    }
}
