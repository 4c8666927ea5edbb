//! Protocol errors and their wire representation.

use chrono::{DateTime, Utc};
use piecestore_core::{NodeId, PieceAction, PieceId, PieceIdError, SerialNumber, SigningError};
use piecestore_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::message::Method;
use crate::transport::TransportError;

/// Error class sent to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ErrorCode {
    InvalidArgument,
    Unauthenticated,
    /// Integrity check failed.
    DataLoss,
    OutOfSequence,
    NotFound,
    ResourceExhausted,
    Internal,
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Deserialize, Serialize)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Reasons an order limit, order or signed request is refused.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("action {0:?} is not allowed for this operation")]
    WrongAction(PieceAction),

    #[error("order limit is for storage node {0}")]
    WrongNode(NodeId),

    #[error("order limit expired at {0}")]
    OrderExpired(DateTime<Utc>),

    #[error("piece expiration {0} has already passed")]
    PieceExpired(DateTime<Utc>),

    #[error("order limit created in the future at {0}")]
    CreatedInFuture(DateTime<Utc>),

    #[error("satellite {0} is untrusted")]
    UntrustedSatellite(NodeId),

    #[error("signature verification failed: {0}")]
    Signature(#[from] SigningError),

    #[error("serial number {0} was already used")]
    SerialReused(SerialNumber),

    #[error("order serial number {got} does not match the order limit")]
    SerialMismatch { got: SerialNumber },

    #[error("order amount {amount} is lower than the previous amount {previous}")]
    OrderDecreased { amount: u64, previous: u64 },

    #[error("{requested} bytes exceed the order limit of {limit} bytes")]
    LimitExceeded { requested: u64, limit: u64 },

    #[error("{requested} bytes exceed the {allowed} bytes covered by orders")]
    AllowanceExceeded { requested: u64, allowed: u64 },

    #[error("request issued at {0} is outside the allowed clock skew")]
    StaleRequest(DateTime<Utc>),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid piece identity: {0}")]
    Identity(#[from] PieceIdError),

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Out of sequence: {0}")]
    Sequencing(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Piece not found: {0}")]
    NotFound(PieceId),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to sign response: {0}")]
    Signing(SigningError),

    #[error("Stream closed before the session completed")]
    UnexpectedEof,

    #[error("Timed out waiting for the next message")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(#[from] RpcError),
}

impl From<StorageError> for ProtocolError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(piece_id) => ProtocolError::NotFound(piece_id),
            other => ProtocolError::Storage(other),
        }
    }
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Identity(_) | ProtocolError::InvalidArgument(_) => {
                ErrorCode::InvalidArgument
            }
            ProtocolError::Unauthorized(_) => ErrorCode::Unauthenticated,
            ProtocolError::Integrity(_) => ErrorCode::DataLoss,
            ProtocolError::Sequencing(_) | ProtocolError::UnexpectedEof => ErrorCode::OutOfSequence,
            ProtocolError::NotFound(_) => ErrorCode::NotFound,
            ProtocolError::Timeout => ErrorCode::Unavailable,
            ProtocolError::Storage(_) | ProtocolError::Transport(_) | ProtocolError::Signing(_) => {
                ErrorCode::Internal
            }
            ProtocolError::Remote(err) => err.code,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        let message = match self {
            // Internal details stay on the node.
            ProtocolError::Storage(_) | ProtocolError::Signing(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        RpcError::new(self.code(), message)
    }

    /// Log a failed RPC at a level matching the error class.
    pub fn log(&self, method: Method) {
        match self {
            ProtocolError::Integrity(_) => warn!("Integrity failure in {method:?}: {self}"),
            ProtocolError::Unauthorized(_) => info!("Rejected {method:?}: {self}"),
            ProtocolError::Storage(_) | ProtocolError::Signing(_) => {
                error!("{method:?} failed: {self}")
            }
            _ => debug!("{method:?} failed: {self}"),
        }
    }
}
