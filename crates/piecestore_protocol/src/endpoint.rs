//! Storage node side of the piece transfer protocol.
//!
//! [`Endpoint::dispatch`] serves one stream: it reads the [`Preamble`], runs
//! the named RPC to completion and closes the stream. Failures are logged,
//! reported to the peer as an `Err` reply and returned to the caller.

use std::time::Duration;

use piecestore_core::bloom::BloomFilter;
use piecestore_core::{PieceAction, PieceId};
use piecestore_storage::{ExpirationDb, Storage, StorageError};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::constants::{MAX_CHUNK_SIZE, PROTOCOL_VERSION, STREAM_TIMEOUT};
use crate::error::ProtocolError;
use crate::message::{
    DeletePiecesRequest, DeletePiecesResponse, DeleteRequest, DeleteResponse, DownloadRequest,
    DownloadResponse, Method, Preamble, Reply, RestoreTrashRequest, RestoreTrashResponse,
    RetainRequest, RetainResponse, SignedRequest, UploadRequest,
};
use crate::retain::RetainQueue;
use crate::session::{DownloadSession, SessionContext, SessionState, UploadSession};
use crate::transport::Transport;

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// How long to wait for the peer's next message.
    pub stream_timeout: Duration,
    /// Largest payload sent in one download chunk.
    pub max_chunk_size: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            stream_timeout: STREAM_TIMEOUT,
            max_chunk_size: MAX_CHUNK_SIZE as u64,
        }
    }
}

pub struct Endpoint<S> {
    ctx: SessionContext<S>,
    config: EndpointConfig,
    expirations: Option<ExpirationDb>,
    retain: RetainQueue,
}

impl<S: Storage> Endpoint<S> {
    pub fn new(ctx: SessionContext<S>, config: EndpointConfig, retain: RetainQueue) -> Self {
        Self {
            ctx,
            config,
            expirations: None,
            retain,
        }
    }

    /// Record piece expirations from upload order limits in `db`.
    pub fn with_expirations(mut self, db: ExpirationDb) -> Self {
        self.expirations = Some(db);
        self
    }

    pub fn context(&self) -> &SessionContext<S> {
        &self.ctx
    }

    /// Serve one stream.
    pub async fn dispatch<R, W>(&self, mut transport: Transport<R, W>) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let preamble: Preamble = self.expect_message(&mut transport).await?;
        let method = preamble.method;

        let result = if preamble.version != PROTOCOL_VERSION {
            Err(ProtocolError::InvalidArgument(format!(
                "unsupported protocol version {}",
                preamble.version
            )))
        } else {
            match method {
                Method::Upload => self.upload(&mut transport).await,
                Method::Download => self.download(&mut transport).await,
                Method::Delete => self.delete(&mut transport).await,
                Method::DeletePieces => self.delete_pieces(&mut transport).await,
                Method::Retain => self.retain(&mut transport).await,
                Method::RestoreTrash => self.restore_trash(&mut transport).await,
            }
        };

        if let Err(err) = &result {
            err.log(method);
            if !matches!(err, ProtocolError::Transport(_)) {
                let reply: Reply<()> = Err(err.to_rpc());
                if let Err(send_err) = transport.send(&reply).await {
                    debug!("Failed to report {method:?} error to peer: {send_err}");
                }
            }
        }
        if let Err(err) = transport.close().await {
            debug!("Failed to close {method:?} stream: {err}");
        }
        result
    }

    async fn upload<R, W>(&self, transport: &mut Transport<R, W>) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut session = UploadSession::new(self.ctx.clone());
        loop {
            let request = match self.next_message::<UploadRequest, _, _>(transport).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    session.fail().await;
                    return Err(ProtocolError::UnexpectedEof);
                }
                Err(err) => {
                    session.fail().await;
                    return Err(err);
                }
            };

            let Some(response) = session.handle(request).await? else {
                continue;
            };

            if let Some(limit) = session.limit() {
                info!(
                    "Stored piece {} ({} bytes)",
                    limit.piece_id, response.done.piece_size
                );
                if let (Some(db), Some(expiration)) = (&self.expirations, limit.piece_expiration) {
                    if let Err(err) = db.set(&limit.piece_id, expiration).await {
                        warn!(
                            "Failed to record expiration of piece {}: {err}",
                            limit.piece_id
                        );
                    }
                }
            }
            transport.send(&Reply::Ok(response)).await?;
            return Ok(());
        }
    }

    async fn download<R, W>(&self, transport: &mut Transport<R, W>) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut session = DownloadSession::new(self.ctx.clone());
        let mut incoming_open = true;

        loop {
            while let Some(chunk) = session.next_chunk(self.config.max_chunk_size).await? {
                let reply: Reply<DownloadResponse> = Ok(DownloadResponse::Chunk(chunk));
                transport.send(&reply).await?;
            }
            if !incoming_open {
                break;
            }

            match self.next_message::<DownloadRequest, _, _>(transport).await {
                Ok(Some(request)) => {
                    if let Some(response) = session.handle(request).await? {
                        transport.send(&Reply::Ok(response)).await?;
                    }
                }
                Ok(None) if session.state() == SessionState::AwaitingLimit => {
                    session.fail();
                    return Err(ProtocolError::UnexpectedEof);
                }
                Ok(None) => incoming_open = false,
                Err(err) => {
                    session.fail();
                    return Err(err);
                }
            }
        }

        session.finish();
        Ok(())
    }

    /// Deprecated single-piece delete authorized by a `Delete` order limit.
    async fn delete<R, W>(&self, transport: &mut Transport<R, W>) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request: DeleteRequest = self.expect_message(transport).await?;
        self.ctx
            .verifier
            .verify_order_limit(&request.limit, |action| action == PieceAction::Delete)?;

        self.delete_piece(&request.limit.piece_id).await?;
        info!("Deleted piece {}", request.limit.piece_id);
        transport.send(&Reply::Ok(DeleteResponse)).await?;
        Ok(())
    }

    async fn delete_pieces<R, W>(
        &self,
        transport: &mut Transport<R, W>,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request: SignedRequest<DeletePiecesRequest> = self.expect_message(transport).await?;
        self.ctx.verifier.verify_request(&request)?;

        let requested = request.body.piece_ids.len();
        let mut unhandled_count = 0u64;
        for piece_id in &request.body.piece_ids {
            match self.delete_piece(piece_id).await {
                Ok(()) => {}
                Err(StorageError::NotFound(_)) => {
                    debug!("Piece {piece_id} requested for deletion is not stored");
                    unhandled_count += 1;
                }
                Err(err) => {
                    warn!("Failed to delete piece {piece_id}: {err}");
                    unhandled_count += 1;
                }
            }
        }

        info!(
            "Deleted {} of {requested} pieces for satellite {}",
            requested as u64 - unhandled_count,
            request.satellite_id
        );
        transport
            .send(&Reply::Ok(DeletePiecesResponse { unhandled_count }))
            .await?;
        Ok(())
    }

    async fn retain<R, W>(&self, transport: &mut Transport<R, W>) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request: SignedRequest<RetainRequest> = self.expect_message(transport).await?;
        self.ctx.verifier.verify_request(&request)?;

        let filter = BloomFilter::from_bytes(&request.body.filter)
            .map_err(|err| ProtocolError::InvalidArgument(format!("invalid bloom filter: {err}")))?;
        if self.retain.queue(request.body.creation_date, filter) {
            info!(
                "Queued retain for pieces created before {} from satellite {}",
                request.body.creation_date, request.satellite_id
            );
        }

        transport.send(&Reply::Ok(RetainResponse)).await?;
        Ok(())
    }

    async fn restore_trash<R, W>(
        &self,
        transport: &mut Transport<R, W>,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request: SignedRequest<RestoreTrashRequest> = self.expect_message(transport).await?;
        self.ctx.verifier.verify_request(&request)?;

        let restored = self.ctx.storage.restore_trash().await?;
        info!(
            "Restored {} pieces from trash for satellite {}",
            restored.len(),
            request.satellite_id
        );
        transport.send(&Reply::Ok(RestoreTrashResponse)).await?;
        Ok(())
    }

    /// Remove a piece and forget its expiration.
    async fn delete_piece(&self, piece_id: &PieceId) -> Result<(), StorageError> {
        self.ctx.storage.delete(piece_id).await?;
        if let Some(db) = &self.expirations {
            if let Err(err) = db.delete(piece_id).await {
                warn!("Failed to forget expiration of piece {piece_id}: {err}");
            }
        }
        Ok(())
    }

    async fn next_message<M, R, W>(
        &self,
        transport: &mut Transport<R, W>,
    ) -> Result<Option<M>, ProtocolError>
    where
        M: DeserializeOwned,
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        tokio::time::timeout(self.config.stream_timeout, transport.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(ProtocolError::from)
    }

    async fn expect_message<M, R, W>(
        &self,
        transport: &mut Transport<R, W>,
    ) -> Result<M, ProtocolError>
    where
        M: DeserializeOwned,
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.next_message(transport)
            .await?
            .ok_or(ProtocolError::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use piecestore_core::HashAlgorithm;
    use piecestore_storage::MemoryStorage;

    use super::*;
    use crate::error::ErrorCode;
    use crate::message::{ChunkRequest, PieceChunk};
    use crate::retain::{RetainConfig, RetainService};
    use crate::session::test_utils::Harness;
    use crate::transport::memory_pair;

    fn endpoint(h: &Harness, config: EndpointConfig) -> Endpoint<MemoryStorage> {
        let (_service, queue) = RetainService::new(
            RetainConfig::default(),
            h.ctx.storage.clone(),
            h.ctx.in_flight.clone(),
        );
        Endpoint::new(h.ctx.clone(), config, queue)
    }

    #[tokio::test]
    async fn test_wrong_version_is_rejected() {
        let h = Harness::new();
        let endpoint = endpoint(&h, EndpointConfig::default());
        let (mut client, server) = memory_pair(64 * 1024);

        client
            .send(&Preamble {
                version: PROTOCOL_VERSION + 1,
                method: Method::RestoreTrash,
            })
            .await
            .unwrap();
        let err = endpoint.dispatch(server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument(_)));

        let reply: Reply<RestoreTrashResponse> = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.unwrap_err().code, ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_idle_upload_times_out() {
        let h = Harness::new();
        let endpoint = endpoint(
            &h,
            EndpointConfig {
                stream_timeout: Duration::from_millis(50),
                ..EndpointConfig::default()
            },
        );
        let (mut client, server) = memory_pair(64 * 1024);

        let piece_id = PieceId::generate();
        let limit = h.limit(piece_id, PieceAction::Put, 100);
        client
            .send(&Preamble {
                version: PROTOCOL_VERSION,
                method: Method::Upload,
            })
            .await
            .unwrap();
        client
            .send(&UploadRequest::Limit {
                limit: limit.clone(),
                hash_algorithm: HashAlgorithm::Sha256,
            })
            .await
            .unwrap();
        client
            .send(&UploadRequest::Order(h.order(&limit, 100)))
            .await
            .unwrap();
        client
            .send(&UploadRequest::Chunk(PieceChunk {
                offset: 0,
                data: vec![1; 10],
            }))
            .await
            .unwrap();

        let err = endpoint.dispatch(server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
        assert!(!h.ctx.storage.exists(&piece_id).await.unwrap());
        assert!(!h.ctx.in_flight.contains(&piece_id));

        let reply: Reply<()> = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.unwrap_err().code, ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn test_download_of_missing_piece() {
        let h = Harness::new();
        let endpoint = endpoint(&h, EndpointConfig::default());
        let (mut client, server) = memory_pair(64 * 1024);

        client
            .send(&Preamble {
                version: PROTOCOL_VERSION,
                method: Method::Download,
            })
            .await
            .unwrap();
        client
            .send(&DownloadRequest::Limit {
                limit: h.limit(PieceId::generate(), PieceAction::Get, 100),
                chunk: ChunkRequest { offset: 0, size: 100 },
            })
            .await
            .unwrap();

        let err = endpoint.dispatch(server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotFound(_)));
        let reply: Reply<DownloadResponse> = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.unwrap_err().code, ErrorCode::NotFound);
    }
}
