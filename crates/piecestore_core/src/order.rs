//! Order limits, orders and piece hashes.
//!
//! A satellite authorizes a transfer by signing an [`OrderLimit`]. The uplink
//! then pays for bytes with cumulative [`Order`]s against that limit, and both
//! sides prove what was stored with signed [`PieceHash`]es.

use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::hash::HashAlgorithm;
use crate::node_id::NodeId;
use crate::piece_id::PieceId;
use crate::signing::Signable;

/// Identifies one order limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SerialNumber([u8; 16]);

impl SerialNumber {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PieceAction {
    Put,
    Get,
    GetAudit,
    GetRepair,
    PutRepair,
    Delete,
    PutGraceful,
}

impl PieceAction {
    pub fn is_upload(self) -> bool {
        matches!(
            self,
            PieceAction::Put | PieceAction::PutRepair | PieceAction::PutGraceful
        )
    }

    pub fn is_download(self) -> bool {
        matches!(
            self,
            PieceAction::Get | PieceAction::GetAudit | PieceAction::GetRepair
        )
    }
}

/// Satellite-signed authorization for one transfer of one piece.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderLimit {
    pub serial_number: SerialNumber,
    pub satellite_id: NodeId,
    /// ed25519 key the uplink signs orders and piece hashes with.
    pub uplink_public_key: NodeId,
    pub storage_node_id: NodeId,
    /// Node-local (derived) piece ID.
    pub piece_id: PieceId,
    /// Maximum number of bytes this limit pays for.
    pub limit: u64,
    pub action: PieceAction,
    #[serde(with = "chrono::serde::ts_microseconds_option")]
    pub piece_expiration: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub order_expiration: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub order_creation: DateTime<Utc>,
    pub satellite_signature: Vec<u8>,
}

/// Uplink-signed claim for `amount` bytes (cumulative) against an order limit.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Order {
    pub serial_number: SerialNumber,
    pub amount: u64,
    pub uplink_signature: Vec<u8>,
}

/// Signed statement of a piece's contents.
///
/// Uploaders send one to finish an upload; the storage node answers with its
/// own.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PieceHash {
    pub piece_id: PieceId,
    pub hash: Vec<u8>,
    pub piece_size: u64,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: DateTime<Utc>,
    pub hash_algorithm: HashAlgorithm,
    pub signature: Vec<u8>,
}

impl Signable for OrderLimit {
    fn signature(&self) -> &[u8] {
        &self.satellite_signature
    }

    fn set_signature(&mut self, signature: Vec<u8>) {
        self.satellite_signature = signature;
    }
}

impl Signable for Order {
    fn signature(&self) -> &[u8] {
        &self.uplink_signature
    }

    fn set_signature(&mut self, signature: Vec<u8>) {
        self.uplink_signature = signature;
    }
}

impl Signable for PieceHash {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, SubsecRound};

    use super::*;
    use crate::encoding;

    #[test]
    fn test_actions() {
        assert!(PieceAction::Put.is_upload());
        assert!(PieceAction::PutGraceful.is_upload());
        assert!(!PieceAction::Get.is_upload());
        assert!(PieceAction::GetAudit.is_download());
        assert!(!PieceAction::Delete.is_download());
        assert!(!PieceAction::Delete.is_upload());
    }

    #[test]
    fn test_order_limit_encoding_keeps_microseconds() {
        let now = Utc::now().trunc_subsecs(6);
        let limit = OrderLimit {
            serial_number: SerialNumber::generate(),
            satellite_id: NodeId::new([1; 32]),
            uplink_public_key: NodeId::new([2; 32]),
            storage_node_id: NodeId::new([3; 32]),
            piece_id: PieceId::generate(),
            limit: 4096,
            action: PieceAction::Put,
            piece_expiration: Some(now + Duration::days(30)),
            order_expiration: now + Duration::hours(1),
            order_creation: now,
            satellite_signature: vec![9; 64],
        };

        let bytes = encoding::serialize(&limit).unwrap();
        let decoded: OrderLimit = encoding::deserialize(&bytes).unwrap();
        assert_eq!(decoded, limit);
    }

    #[test]
    fn test_serial_numbers_are_unique() {
        assert_ne!(SerialNumber::generate(), SerialNumber::generate());
        assert_eq!(SerialNumber::new([0xab; 16]).to_string(), "ab".repeat(16));
    }
}
