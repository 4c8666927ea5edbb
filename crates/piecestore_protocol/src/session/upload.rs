//! Upload session state machine.

use chrono::Utc;
use piecestore_core::signing;
use piecestore_core::{
    HashAlgorithm, Order, OrderLimit, PieceAction, PieceHash, PieceHasher,
};
use piecestore_storage::{PieceHeader, PieceWriter, Storage};
use tracing::{debug, warn};

use super::{SessionContext, SessionState};
use crate::error::{AuthError, ProtocolError};
use crate::inflight::InFlightGuard;
use crate::message::{PieceChunk, UploadRequest, UploadResponse};

pub struct UploadSession<S> {
    ctx: SessionContext<S>,
    state: SessionState,
    limit: Option<OrderLimit>,
    hasher: Option<PieceHasher>,
    writer: Option<Box<dyn PieceWriter>>,
    /// Largest accepted order amount.
    allowance: u64,
    _guard: Option<InFlightGuard>,
}

impl<S: Storage> UploadSession<S> {
    pub fn new(ctx: SessionContext<S>) -> Self {
        Self {
            ctx,
            state: SessionState::AwaitingLimit,
            limit: None,
            hasher: None,
            writer: None,
            allowance: 0,
            _guard: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn limit(&self) -> Option<&OrderLimit> {
        self.limit.as_ref()
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u64 {
        self.writer.as_ref().map_or(0, |writer| writer.size())
    }

    /// Apply one request. Returns the node's response once the upload is done.
    /// Any error fails the session and discards the partial piece.
    pub async fn handle(
        &mut self,
        request: UploadRequest,
    ) -> Result<Option<UploadResponse>, ProtocolError> {
        let result = self.apply(request).await;
        if result.is_err() {
            self.fail().await;
        }
        result
    }

    /// Abandon the upload. Nothing written so far is kept.
    pub async fn fail(&mut self) {
        if self.state.is_terminal() && self.writer.is_none() {
            return;
        }
        self.state = SessionState::Failed;
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.cancel().await {
                warn!("Failed to discard partial upload: {err}");
            }
        }
        self._guard = None;
    }

    async fn apply(
        &mut self,
        request: UploadRequest,
    ) -> Result<Option<UploadResponse>, ProtocolError> {
        match (self.state, request) {
            (
                SessionState::AwaitingLimit,
                UploadRequest::Limit {
                    limit,
                    hash_algorithm,
                },
            ) => {
                self.start(limit, hash_algorithm).await?;
                Ok(None)
            }
            (SessionState::AwaitingLimit, _) => Err(ProtocolError::Sequencing(
                "the first upload message must carry the order limit".into(),
            )),
            (SessionState::Active, UploadRequest::Limit { .. }) => Err(ProtocolError::Sequencing(
                "order limit was already received".into(),
            )),
            (SessionState::Active, UploadRequest::Order(order)) => {
                self.accept_order(order)?;
                Ok(None)
            }
            (SessionState::Active, UploadRequest::Chunk(chunk)) => {
                self.write_chunk(chunk).await?;
                Ok(None)
            }
            (SessionState::Active, UploadRequest::Done(piece_hash)) => {
                self.finish(piece_hash).await.map(Some)
            }
            (state, _) => Err(ProtocolError::Sequencing(format!(
                "upload session is {state:?}"
            ))),
        }
    }

    async fn start(
        &mut self,
        limit: OrderLimit,
        hash_algorithm: HashAlgorithm,
    ) -> Result<(), ProtocolError> {
        self.ctx
            .verifier
            .verify_order_limit(&limit, PieceAction::is_upload)?;

        let writer = self.ctx.storage.writer(limit.piece_id).await?;
        self._guard = Some(self.ctx.in_flight.register(limit.piece_id));
        self.writer = Some(writer);
        self.hasher = Some(hash_algorithm.hasher());

        debug!(
            "Upload of piece {} started: limit {} bytes, {hash_algorithm}",
            limit.piece_id, limit.limit
        );
        self.limit = Some(limit);
        self.state = SessionState::Active;
        Ok(())
    }

    fn accept_order(&mut self, order: Order) -> Result<(), ProtocolError> {
        let limit = self.limit.as_ref().ok_or(ProtocolError::Sequencing(
            "order received before the order limit".into(),
        ))?;
        self.ctx
            .verifier
            .verify_order(limit, &order, self.allowance)?;
        self.allowance = order.amount;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: PieceChunk) -> Result<(), ProtocolError> {
        let (Some(limit), Some(writer), Some(hasher)) =
            (&self.limit, self.writer.as_mut(), self.hasher.as_mut())
        else {
            return Err(ProtocolError::Sequencing("upload is not active".into()));
        };

        let expected = writer.size();
        if chunk.offset != expected {
            return Err(ProtocolError::Sequencing(format!(
                "chunk at offset {}, expected offset {expected}",
                chunk.offset
            )));
        }

        let end = expected + chunk.data.len() as u64;
        if end > limit.limit {
            return Err(AuthError::LimitExceeded {
                requested: end,
                limit: limit.limit,
            }
            .into());
        }
        if end > self.allowance {
            return Err(AuthError::AllowanceExceeded {
                requested: end,
                allowed: self.allowance,
            }
            .into());
        }

        writer.write(&chunk.data).await?;
        hasher.update(&chunk.data);
        Ok(())
    }

    async fn finish(&mut self, piece_hash: PieceHash) -> Result<UploadResponse, ProtocolError> {
        self.state = SessionState::Finalizing;

        let (Some(limit), Some(hasher), Some(size)) = (
            self.limit.clone(),
            self.hasher.take(),
            self.writer.as_ref().map(|writer| writer.size()),
        ) else {
            return Err(ProtocolError::Sequencing("upload is not active".into()));
        };
        let algorithm = hasher.algorithm();
        let computed = hasher.finalize();

        if piece_hash.piece_id != limit.piece_id {
            return Err(ProtocolError::Integrity(format!(
                "piece hash is for {}, order limit is for {}",
                piece_hash.piece_id, limit.piece_id
            )));
        }
        if piece_hash.hash_algorithm != algorithm {
            return Err(ProtocolError::Integrity(format!(
                "piece hash uses {}, upload was hashed with {algorithm}",
                piece_hash.hash_algorithm
            )));
        }
        if piece_hash.piece_size != size {
            return Err(ProtocolError::Integrity(format!(
                "piece hash claims {} bytes, received {size}",
                piece_hash.piece_size
            )));
        }
        if piece_hash.hash != computed {
            return Err(ProtocolError::Integrity(
                "piece hash does not match the received data".into(),
            ));
        }
        signing::verify(&limit.uplink_public_key, &piece_hash).map_err(|err| {
            ProtocolError::Integrity(format!("uplink piece hash signature: {err}"))
        })?;

        let node_hash = self
            .ctx
            .identity
            .sign(PieceHash {
                piece_id: limit.piece_id,
                hash: computed,
                piece_size: size,
                timestamp: Utc::now(),
                hash_algorithm: algorithm,
                signature: Vec::new(),
            })
            .map_err(ProtocolError::Signing)?;

        let header = PieceHeader::from_piece_hash(&piece_hash, limit);
        if let Some(writer) = self.writer.as_mut() {
            writer.commit(header).await?;
        }
        self.writer = None;
        self._guard = None;

        self.state = SessionState::Done;
        Ok(UploadResponse { done: node_hash })
    }
}
