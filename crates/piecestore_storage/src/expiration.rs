//! Piece expiration database.
//!
//! Order limits may carry a piece expiration. Those pieces are recorded here
//! so the expiration collector can delete them once they lapse.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use piecestore_core::PieceId;
use rusqlite::{params, Connection};

use crate::StorageError;

#[derive(Clone, Debug)]
pub struct ExpirationDb {
    conn: Arc<Mutex<Connection>>,
}

impl ExpirationDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS piece_expirations (
                piece_id BLOB PRIMARY KEY NOT NULL,
                piece_expiration INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_piece_expirations_expiration
                ON piece_expirations (piece_expiration);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StorageError::DatabaseTask("connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|err| StorageError::DatabaseTask(err.to_string()))?
    }

    /// Record (or replace) the expiration of a piece.
    pub async fn set(
        &self,
        piece_id: &PieceId,
        expiration: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let cell = piece_id.to_cell();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO piece_expirations (piece_id, piece_expiration) VALUES (?, ?)",
                params![cell, expiration.timestamp_micros()],
            )?;
            Ok(())
        })
        .await
    }

    /// Up to `limit` pieces whose expiration is before `now`, oldest first.
    pub async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PieceId>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT piece_id FROM piece_expirations
                 WHERE piece_expiration < ?
                 ORDER BY piece_expiration
                 LIMIT ?",
            )?;
            let cells = stmt
                .query_map(params![now.timestamp_micros(), limit as i64], |row| {
                    row.get::<_, Option<Vec<u8>>>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            cells
                .iter()
                .map(|cell| Ok(PieceId::from_cell(cell.as_deref())?))
                .collect()
        })
        .await
    }

    /// Forget a piece. Returns whether it was recorded.
    pub async fn delete(&self, piece_id: &PieceId) -> Result<bool, StorageError> {
        let cell = piece_id.to_cell();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM piece_expirations WHERE piece_id = ?",
                params![cell],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn test_expired_pieces_in_order() {
        let db = ExpirationDb::open_in_memory().unwrap();
        let now = Utc::now();
        let oldest = PieceId::generate();
        let older = PieceId::generate();
        let future = PieceId::generate();

        db.set(&older, now - Duration::hours(1)).await.unwrap();
        db.set(&oldest, now - Duration::days(1)).await.unwrap();
        db.set(&future, now + Duration::days(1)).await.unwrap();

        assert_eq!(db.expired(now, 10).await.unwrap(), vec![oldest, older]);
        assert_eq!(db.expired(now, 1).await.unwrap(), vec![oldest]);
    }

    #[tokio::test]
    async fn test_set_replaces_and_delete() {
        let db = ExpirationDb::open_in_memory().unwrap();
        let now = Utc::now();
        let piece_id = PieceId::generate();

        db.set(&piece_id, now - Duration::hours(1)).await.unwrap();
        db.set(&piece_id, now + Duration::hours(1)).await.unwrap();
        assert!(db.expired(now, 10).await.unwrap().is_empty());

        assert!(db.delete(&piece_id).await.unwrap());
        assert!(!db.delete(&piece_id).await.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_concurrent_writers_share_one_connection() {
        let db = ExpirationDb::open_in_memory().unwrap();
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let db = db.clone();
                tokio::spawn(async move {
                    let piece_id = PieceId::generate();
                    db.set(&piece_id, now - Duration::seconds(i + 1)).await.unwrap();
                    piece_id
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(db.expired(now, 100).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_database_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("expirations.db");
        let piece_id = PieceId::generate();
        let expiration = Utc::now() - Duration::minutes(5);

        ExpirationDb::open(&path)
            .unwrap()
            .set(&piece_id, expiration)
            .await
            .unwrap();

        let reopened = ExpirationDb::open(&path).unwrap();
        assert_eq!(reopened.expired(Utc::now(), 10).await.unwrap(), vec![piece_id]);
    }
}
