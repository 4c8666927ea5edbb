//! Piece header: the durable record stored alongside each piece.
//!
//! Format V1 reserves the first [`V1_HEADER_SIZE`] bytes of the piece file for
//! the header: a big-endian `u16` length, the encoded header, then zero
//! padding. The payload starts right after the reserved region. Format V0
//! pieces keep the header in a separate file.

use chrono::{DateTime, Utc};
use piecestore_core::{encoding, HashAlgorithm, OrderLimit, PieceHash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes reserved at the start of a V1 piece file.
pub const V1_HEADER_SIZE: usize = 512;

const LENGTH_PREFIX: usize = 2;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("Failed to encode or decode piece header: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Encoded piece header is {0} bytes, does not fit the reserved region")]
    TooLarge(usize),

    #[error("Piece header region is truncated: {0} bytes")]
    Truncated(usize),

    #[error("Invalid piece header length {0}")]
    InvalidLength(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FormatVersion {
    /// Payload-only file with the header stored next to it.
    V0,
    /// Header framed in the first 512 bytes of the piece file.
    V1,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PieceHeader {
    pub format_version: FormatVersion,
    /// Hash of the payload, as signed by the uploader.
    pub hash: Vec<u8>,
    pub hash_algorithm: HashAlgorithm,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub creation_time: DateTime<Utc>,
    /// Uploader's signature over the piece hash.
    pub signature: Vec<u8>,
    /// The order limit the upload was accepted under.
    pub order_limit: OrderLimit,
}

impl PieceHeader {
    /// Build the header for a piece finished with the uploader's `piece_hash`.
    pub fn from_piece_hash(piece_hash: &PieceHash, order_limit: OrderLimit) -> Self {
        Self {
            format_version: FormatVersion::V1,
            hash: piece_hash.hash.clone(),
            hash_algorithm: piece_hash.hash_algorithm,
            creation_time: piece_hash.timestamp,
            signature: piece_hash.signature.clone(),
            order_limit,
        }
    }

    /// Rebuild the uploader-signed piece hash.
    pub fn piece_hash(&self, piece_size: u64) -> PieceHash {
        PieceHash {
            piece_id: self.order_limit.piece_id,
            hash: self.hash.clone(),
            piece_size,
            timestamp: self.creation_time,
            hash_algorithm: self.hash_algorithm,
            signature: self.signature.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HeaderError> {
        Ok(encoding::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        Ok(encoding::deserialize(bytes)?)
    }

    /// Encode into a full reserved region of [`V1_HEADER_SIZE`] bytes.
    pub fn encode_framed(&self) -> Result<Vec<u8>, HeaderError> {
        let encoded = self.encode()?;
        if encoded.len() > V1_HEADER_SIZE - LENGTH_PREFIX {
            return Err(HeaderError::TooLarge(encoded.len()));
        }

        let mut region = vec![0u8; V1_HEADER_SIZE];
        region[..LENGTH_PREFIX].copy_from_slice(&(encoded.len() as u16).to_be_bytes());
        region[LENGTH_PREFIX..LENGTH_PREFIX + encoded.len()].copy_from_slice(&encoded);
        Ok(region)
    }

    /// Decode the header from the start of a V1 piece file.
    pub fn decode_framed(region: &[u8]) -> Result<Self, HeaderError> {
        if region.len() < V1_HEADER_SIZE {
            return Err(HeaderError::Truncated(region.len()));
        }

        let len = u16::from_be_bytes([region[0], region[1]]) as usize;
        if len == 0 || len > V1_HEADER_SIZE - LENGTH_PREFIX {
            return Err(HeaderError::InvalidLength(len));
        }
        Self::decode(&region[LENGTH_PREFIX..LENGTH_PREFIX + len])
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, SubsecRound};
    use piecestore_core::{NodeId, PieceAction, PieceId, SerialNumber};

    use super::*;

    fn header() -> PieceHeader {
        let now = Utc::now().trunc_subsecs(6);
        PieceHeader {
            format_version: FormatVersion::V1,
            hash: HashAlgorithm::Sha256.digest(b"piece"),
            hash_algorithm: HashAlgorithm::Sha256,
            creation_time: now,
            signature: vec![7; 64],
            order_limit: OrderLimit {
                serial_number: SerialNumber::generate(),
                satellite_id: NodeId::new([1; 32]),
                uplink_public_key: NodeId::new([2; 32]),
                storage_node_id: NodeId::new([3; 32]),
                piece_id: PieceId::generate(),
                limit: 1 << 20,
                action: PieceAction::Put,
                piece_expiration: Some(now + Duration::days(7)),
                order_expiration: now + Duration::hours(1),
                order_creation: now,
                satellite_signature: vec![8; 64],
            },
        }
    }

    #[test]
    fn test_framed_header_roundtrip() {
        let header = header();
        let region = header.encode_framed().unwrap();
        assert_eq!(region.len(), V1_HEADER_SIZE);

        let decoded = PieceHeader::decode_framed(&region).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.order_limit.piece_id, header.order_limit.piece_id);
    }

    #[test]
    fn test_framed_header_ignores_trailing_payload() {
        let header = header();
        let mut file = header.encode_framed().unwrap();
        file.extend_from_slice(b"payload bytes");
        assert_eq!(PieceHeader::decode_framed(&file).unwrap(), header);
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut header = header();
        header.signature = vec![0; V1_HEADER_SIZE];
        assert!(matches!(
            header.encode_framed().unwrap_err(),
            HeaderError::TooLarge(_)
        ));
    }

    #[test]
    fn test_malformed_regions_rejected() {
        assert!(matches!(
            PieceHeader::decode_framed(&[0u8; 100]).unwrap_err(),
            HeaderError::Truncated(100)
        ));
        assert!(matches!(
            PieceHeader::decode_framed(&[0u8; V1_HEADER_SIZE]).unwrap_err(),
            HeaderError::InvalidLength(0)
        ));

        let mut region = vec![0u8; V1_HEADER_SIZE];
        region[0] = 0xff;
        assert!(matches!(
            PieceHeader::decode_framed(&region).unwrap_err(),
            HeaderError::InvalidLength(_)
        ));

        region[0] = 0;
        region[1] = 10;
        assert!(matches!(
            PieceHeader::decode_framed(&region).unwrap_err(),
            HeaderError::Encoding(_)
        ));
    }

    #[test]
    fn test_piece_hash_reconstruction() {
        let header = header();
        let hash = header.piece_hash(5);
        assert_eq!(hash.piece_id, header.order_limit.piece_id);
        assert_eq!(hash.piece_size, 5);
        assert_eq!(hash.timestamp, header.creation_time);
        assert_eq!(PieceHeader::from_piece_hash(&hash, header.order_limit.clone()), header);
    }
}
