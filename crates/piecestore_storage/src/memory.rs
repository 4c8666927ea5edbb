//! In-memory storage, mostly for testing purposes

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use piecestore_core::PieceId;

use crate::header::PieceHeader;
use crate::{PieceInfo, PieceReader, PieceWriter, Storage, StorageError};

#[derive(Clone, Debug)]
struct StoredPiece {
    data: Arc<Vec<u8>>,
    header: PieceHeader,
}

/// In-memory storage implementation.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    pieces: Arc<DashMap<PieceId, StoredPiece>>,
    trash: Arc<DashMap<PieceId, (StoredPiece, DateTime<Utc>)>>,
}

impl MemoryStorage {
    /// Create a new empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of live pieces stored.
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Check if storage is empty.
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Get the number of trashed pieces.
    pub fn trash_len(&self) -> usize {
        self.trash.len()
    }

    fn get(&self, piece_id: &PieceId) -> Result<StoredPiece, StorageError> {
        self.pieces
            .get(piece_id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound(*piece_id))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn writer(&self, piece_id: PieceId) -> Result<Box<dyn PieceWriter>, StorageError> {
        Ok(Box::new(MemoryPieceWriter {
            piece_id,
            pieces: Arc::clone(&self.pieces),
            buffer: Some(Vec::new()),
        }))
    }

    async fn reader(&self, piece_id: &PieceId) -> Result<Box<dyn PieceReader>, StorageError> {
        let piece = self.get(piece_id)?;
        Ok(Box::new(MemoryPieceReader { piece }))
    }

    async fn stat(&self, piece_id: &PieceId) -> Result<PieceInfo, StorageError> {
        let piece = self.get(piece_id)?;
        Ok(PieceInfo {
            piece_id: *piece_id,
            size: piece.data.len() as u64,
            header: piece.header,
        })
    }

    async fn exists(&self, piece_id: &PieceId) -> Result<bool, StorageError> {
        Ok(self.pieces.contains_key(piece_id))
    }

    async fn delete(&self, piece_id: &PieceId) -> Result<(), StorageError> {
        self.pieces
            .remove(piece_id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(*piece_id))
    }

    async fn trash(&self, piece_id: &PieceId) -> Result<(), StorageError> {
        let (_, piece) = self
            .pieces
            .remove(piece_id)
            .ok_or(StorageError::NotFound(*piece_id))?;
        self.trash.insert(*piece_id, (piece, Utc::now()));
        Ok(())
    }

    async fn restore_trash(&self) -> Result<Vec<PieceId>, StorageError> {
        let trashed: Vec<PieceId> = self.trash.iter().map(|entry| *entry.key()).collect();
        let mut restored = Vec::with_capacity(trashed.len());
        for piece_id in trashed {
            if let Some((_, (piece, _))) = self.trash.remove(&piece_id) {
                self.pieces.insert(piece_id, piece);
                restored.push(piece_id);
            }
        }
        Ok(restored)
    }

    async fn empty_trash(
        &self,
        trashed_before: DateTime<Utc>,
    ) -> Result<Vec<PieceId>, StorageError> {
        let expired: Vec<PieceId> = self
            .trash
            .iter()
            .filter(|entry| entry.value().1 < trashed_before)
            .map(|entry| *entry.key())
            .collect();
        for piece_id in &expired {
            self.trash.remove(piece_id);
        }
        Ok(expired)
    }

    async fn list(&self) -> Result<Vec<PieceInfo>, StorageError> {
        Ok(self
            .pieces
            .iter()
            .map(|entry| PieceInfo {
                piece_id: *entry.key(),
                size: entry.value().data.len() as u64,
                header: entry.value().header.clone(),
            })
            .collect())
    }
}

struct MemoryPieceWriter {
    piece_id: PieceId,
    pieces: Arc<DashMap<PieceId, StoredPiece>>,
    buffer: Option<Vec<u8>>,
}

impl MemoryPieceWriter {
    fn buffer(&mut self) -> Result<&mut Vec<u8>, StorageError> {
        self.buffer
            .as_mut()
            .ok_or_else(|| StorageError::WriteError("piece writer is closed".into()))
    }
}

#[async_trait]
impl PieceWriter for MemoryPieceWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buffer()?.extend_from_slice(data);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |buffer| buffer.len() as u64)
    }

    async fn commit(&mut self, header: PieceHeader) -> Result<(), StorageError> {
        let data = self
            .buffer
            .take()
            .ok_or_else(|| StorageError::WriteError("piece writer is closed".into()))?;
        self.pieces.insert(
            self.piece_id,
            StoredPiece {
                data: Arc::new(data),
                header,
            },
        );
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), StorageError> {
        self.buffer = None;
        Ok(())
    }
}

struct MemoryPieceReader {
    piece: StoredPiece,
}

#[async_trait]
impl PieceReader for MemoryPieceReader {
    fn size(&self) -> u64 {
        self.piece.data.len() as u64
    }

    fn header(&self) -> &PieceHeader {
        &self.piece.header
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let start = usize::try_from(offset)
            .map_err(|_| StorageError::ReadError(format!("offset {offset} out of range")))?;
        start
            .checked_add(len)
            .and_then(|end| self.piece.data.get(start..end))
            .map(|slice| slice.to_vec())
            .ok_or_else(|| {
                StorageError::ReadError(format!(
                    "range {offset}+{len} is outside the {}-byte piece",
                    self.piece.data.len()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_utils::{header_for, random_bytes};

    async fn put(storage: &MemoryStorage, data: &[u8]) -> PieceId {
        let piece_id = PieceId::generate();
        let mut writer = storage.writer(piece_id).await.unwrap();
        writer.write(data).await.unwrap();
        assert_eq!(writer.size(), data.len() as u64);
        writer.commit(header_for(piece_id, data)).await.unwrap();
        piece_id
    }

    #[tokio::test]
    async fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        let data = random_bytes(128);
        let piece_id = put(&storage, &data).await;
        assert_eq!(storage.len(), 1);

        let mut reader = storage.reader(&piece_id).await.unwrap();
        assert_eq!(reader.size(), 128);
        assert_eq!(reader.read_at(100, 28).await.unwrap(), data[100..]);
        assert!(reader.read_at(100, 29).await.is_err());

        assert_eq!(storage.stat(&piece_id).await.unwrap().size, 128);
        storage.delete(&piece_id).await.unwrap();
        assert!(matches!(
            storage.delete(&piece_id).await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_uncommitted_write_is_invisible() {
        let storage = MemoryStorage::new();
        let piece_id = PieceId::generate();
        let mut writer = storage.writer(piece_id).await.unwrap();
        writer.write(b"partial").await.unwrap();
        assert!(!storage.exists(&piece_id).await.unwrap());
        writer.cancel().await.unwrap();
        assert!(writer.commit(header_for(piece_id, b"")).await.is_err());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_memory_trash() {
        let storage = MemoryStorage::new();
        let piece_id = put(&storage, &random_bytes(8)).await;

        storage.trash(&piece_id).await.unwrap();
        assert_eq!(storage.trash_len(), 1);
        assert!(storage.list().await.unwrap().is_empty());

        assert_eq!(storage.restore_trash().await.unwrap(), vec![piece_id]);
        assert_eq!(storage.len(), 1);

        storage.trash(&piece_id).await.unwrap();
        assert!(storage
            .empty_trash(Utc::now() - Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            storage
                .empty_trash(Utc::now() + Duration::minutes(1))
                .await
                .unwrap(),
            vec![piece_id]
        );
        assert_eq!(storage.trash_len(), 0);
    }
}
