//! Durable piece storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use piecestore_core::{PieceId, PieceIdError};
use thiserror::Error;

pub mod expiration;
pub mod header;
pub mod local;
pub mod memory;

pub use expiration::ExpirationDb;
pub use header::{FormatVersion, HeaderError, PieceHeader, V1_HEADER_SIZE};
pub use local::LocalStorage;
pub use memory::MemoryStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage read error: {0}")]
    ReadError(String),

    #[error("Storage write error: {0}")]
    WriteError(String),

    #[error("Piece not found: {0}")]
    NotFound(PieceId),

    #[error("Piece header error: {0}")]
    Header(#[from] HeaderError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database task failed: {0}")]
    DatabaseTask(String),

    #[error("Invalid piece ID in storage: {0}")]
    PieceId(#[from] PieceIdError),
}

/// Metadata of a stored piece.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_id: PieceId,
    /// Payload size, excluding any header region.
    pub size: u64,
    pub header: PieceHeader,
}

/// In-progress piece write.
///
/// Nothing is visible to readers until [`PieceWriter::commit`] succeeds. A
/// writer dropped without committing discards everything written.
#[async_trait]
pub trait PieceWriter: Send {
    /// Append payload bytes.
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Payload bytes written so far.
    fn size(&self) -> u64;

    /// Persist `header` and publish the piece atomically.
    async fn commit(&mut self, header: PieceHeader) -> Result<(), StorageError>;

    /// Discard the write.
    async fn cancel(&mut self) -> Result<(), StorageError>;
}

/// Random access to a stored piece's payload.
#[async_trait]
pub trait PieceReader: Send {
    fn size(&self) -> u64;

    fn header(&self) -> &PieceHeader;

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;
}

/// Piece storage interface.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Start writing a piece. Any committed piece with the same ID is replaced
    /// on commit.
    async fn writer(&self, piece_id: PieceId) -> Result<Box<dyn PieceWriter>, StorageError>;

    async fn reader(&self, piece_id: &PieceId) -> Result<Box<dyn PieceReader>, StorageError>;

    async fn stat(&self, piece_id: &PieceId) -> Result<PieceInfo, StorageError>;

    async fn exists(&self, piece_id: &PieceId) -> Result<bool, StorageError>;

    /// Remove a piece. Fails with [`StorageError::NotFound`] if it is not stored.
    async fn delete(&self, piece_id: &PieceId) -> Result<(), StorageError>;

    /// Move a piece to the trash, recording the current time.
    async fn trash(&self, piece_id: &PieceId) -> Result<(), StorageError>;

    /// Move every trashed piece back. Returns the restored IDs.
    async fn restore_trash(&self) -> Result<Vec<PieceId>, StorageError>;

    /// Permanently remove pieces trashed before `trashed_before`.
    async fn empty_trash(
        &self,
        trashed_before: DateTime<Utc>,
    ) -> Result<Vec<PieceId>, StorageError>;

    /// All live pieces.
    async fn list(&self) -> Result<Vec<PieceInfo>, StorageError>;
}
