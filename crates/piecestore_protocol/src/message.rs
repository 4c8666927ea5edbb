//! Wire messages of the piece transfer protocol.
//!
//! Every stream starts with a [`Preamble`] naming the RPC. The server answers
//! each response slot with a [`Reply`]; an `Err` reply ends the stream.

use chrono::{DateTime, Utc};
use piecestore_core::{
    HashAlgorithm, Identity, NodeId, Order, OrderLimit, PieceHash, PieceId, Signable,
    SigningError,
};
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

pub type Reply<T> = Result<T, RpcError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Method {
    Upload,
    Download,
    /// Deprecated in favour of [`Method::DeletePieces`].
    Delete,
    DeletePieces,
    Retain,
    RestoreTrash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Preamble {
    pub version: u16,
    pub method: Method,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PieceChunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum UploadRequest {
    /// Must be the first message of an upload.
    Limit {
        limit: OrderLimit,
        hash_algorithm: HashAlgorithm,
    },
    Order(Order),
    Chunk(PieceChunk),
    /// The uploader's signed hash of the whole piece. Ends the upload.
    Done(PieceHash),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadResponse {
    /// The storage node's signed piece hash.
    pub done: PieceHash,
}

/// A range of the piece payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChunkRequest {
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DownloadRequest {
    /// Must be the first message of a download.
    Limit {
        limit: OrderLimit,
        chunk: ChunkRequest,
    },
    Order(Order),
    Chunk(ChunkRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DownloadResponse {
    /// First response: the uploader's signed hash and the original order limit.
    Header { hash: PieceHash, limit: OrderLimit },
    Chunk(PieceChunk),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeleteRequest {
    pub limit: OrderLimit,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeleteResponse;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeletePiecesRequest {
    pub piece_ids: Vec<PieceId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeletePiecesResponse {
    /// Requested pieces this call did not remove, absent ones included.
    pub unhandled_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetainRequest {
    /// Pieces created before this instant and missing from the filter are trashed.
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub creation_date: DateTime<Utc>,
    /// Encoded bloom filter of the pieces to keep.
    pub filter: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetainResponse;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RestoreTrashRequest;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RestoreTrashResponse;

/// Administrative request signed by a satellite.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SignedRequest<T> {
    pub body: T,
    pub satellite_id: NodeId,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub issued_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl<T: Serialize + Clone> SignedRequest<T> {
    pub fn new(satellite: &Identity, body: T) -> Result<Self, SigningError> {
        satellite.sign(Self {
            body,
            satellite_id: satellite.node_id(),
            issued_at: Utc::now(),
            signature: Vec::new(),
        })
    }
}

impl<T: Serialize + Clone> Signable for SignedRequest<T> {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }
}

#[cfg(test)]
mod tests {
    use piecestore_core::{encoding, signing};

    use super::*;

    #[test]
    fn test_signed_request_verifies() {
        let satellite = Identity::generate();
        let request = SignedRequest::new(
            &satellite,
            DeletePiecesRequest {
                piece_ids: vec![PieceId::generate(), PieceId::generate()],
            },
        )
        .unwrap();
        signing::verify(&satellite.node_id(), &request).unwrap();

        let mut tampered = request.clone();
        tampered.body.piece_ids.pop();
        assert!(signing::verify(&satellite.node_id(), &tampered).is_err());
    }

    #[test]
    fn test_reply_encoding() {
        let ok: Reply<DeletePiecesResponse> = Ok(DeletePiecesResponse { unhandled_count: 3 });
        let bytes = encoding::serialize(&ok).unwrap();
        assert_eq!(encoding::deserialize::<Reply<DeletePiecesResponse>>(&bytes).unwrap(), ok);

        let err: Reply<RetainResponse> = Err(RpcError::new(
            crate::error::ErrorCode::NotFound,
            "missing",
        ));
        let bytes = encoding::serialize(&err).unwrap();
        assert_eq!(encoding::deserialize::<Reply<RetainResponse>>(&bytes).unwrap(), err);
    }
}
