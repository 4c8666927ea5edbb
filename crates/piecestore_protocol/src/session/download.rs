//! Download session state machine.
//!
//! The uplink names byte ranges with chunk requests and pays for them with
//! orders. The node only ever sends bytes already covered by the largest
//! order amount, so an uplink that stops sending orders stops receiving data.

use std::collections::VecDeque;

use piecestore_core::{Order, OrderLimit, PieceAction};
use piecestore_storage::{PieceReader, Storage};
use tracing::debug;

use super::{SessionContext, SessionState};
use crate::error::{AuthError, ProtocolError};
use crate::inflight::InFlightGuard;
use crate::message::{ChunkRequest, DownloadRequest, DownloadResponse, PieceChunk};

pub struct DownloadSession<S> {
    ctx: SessionContext<S>,
    state: SessionState,
    limit: Option<OrderLimit>,
    reader: Option<Box<dyn PieceReader>>,
    pending: VecDeque<ChunkRequest>,
    allowance: u64,
    served: u64,
    requested: u64,
    _guard: Option<InFlightGuard>,
}

impl<S: Storage> DownloadSession<S> {
    pub fn new(ctx: SessionContext<S>) -> Self {
        Self {
            ctx,
            state: SessionState::AwaitingLimit,
            limit: None,
            reader: None,
            pending: VecDeque::new(),
            allowance: 0,
            served: 0,
            requested: 0,
            _guard: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether requested bytes remain to be sent.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether the next chunk can be sent without another order.
    pub fn can_serve(&self) -> bool {
        self.has_pending() && self.served < self.allowance
    }

    /// Apply one request. The order limit is answered with the piece header.
    pub async fn handle(
        &mut self,
        request: DownloadRequest,
    ) -> Result<Option<DownloadResponse>, ProtocolError> {
        let result = self.apply(request).await;
        if result.is_err() {
            self.fail();
        }
        result
    }

    async fn apply(
        &mut self,
        request: DownloadRequest,
    ) -> Result<Option<DownloadResponse>, ProtocolError> {
        match (self.state, request) {
            (SessionState::AwaitingLimit, DownloadRequest::Limit { limit, chunk }) => {
                self.start(limit, chunk).await.map(Some)
            }
            (SessionState::AwaitingLimit, _) => Err(ProtocolError::Sequencing(
                "the first download message must carry the order limit".into(),
            )),
            (SessionState::Active, DownloadRequest::Limit { .. }) => Err(
                ProtocolError::Sequencing("order limit was already received".into()),
            ),
            (SessionState::Active, DownloadRequest::Order(order)) => {
                self.accept_order(order)?;
                Ok(None)
            }
            (SessionState::Active, DownloadRequest::Chunk(chunk)) => {
                self.queue(chunk)?;
                Ok(None)
            }
            (state, _) => Err(ProtocolError::Sequencing(format!(
                "download session is {state:?}"
            ))),
        }
    }

    async fn start(
        &mut self,
        limit: OrderLimit,
        chunk: ChunkRequest,
    ) -> Result<DownloadResponse, ProtocolError> {
        self.ctx
            .verifier
            .verify_order_limit(&limit, PieceAction::is_download)?;

        let reader = self.ctx.storage.reader(&limit.piece_id).await?;
        let header = reader.header().clone();
        let hash = header.piece_hash(reader.size());

        self._guard = Some(self.ctx.in_flight.register(limit.piece_id));
        self.reader = Some(reader);
        self.limit = Some(limit);
        self.state = SessionState::Active;
        self.queue(chunk)?;

        Ok(DownloadResponse::Header {
            hash,
            limit: header.order_limit,
        })
    }

    fn accept_order(&mut self, order: Order) -> Result<(), ProtocolError> {
        let limit = self.limit.as_ref().ok_or_else(|| {
            ProtocolError::Sequencing("order received before the order limit".into())
        })?;
        self.ctx
            .verifier
            .verify_order(limit, &order, self.allowance)?;
        self.allowance = order.amount;
        Ok(())
    }

    fn queue(&mut self, chunk: ChunkRequest) -> Result<(), ProtocolError> {
        let (Some(limit), Some(reader)) = (&self.limit, &self.reader) else {
            return Err(ProtocolError::Sequencing("download is not active".into()));
        };

        if chunk.size == 0 {
            return Err(ProtocolError::InvalidArgument(
                "chunk size must be positive".into(),
            ));
        }
        let end = chunk.offset.checked_add(chunk.size).ok_or_else(|| {
            ProtocolError::InvalidArgument("chunk range overflows".into())
        })?;
        if end > reader.size() {
            return Err(ProtocolError::InvalidArgument(format!(
                "range {}..{end} is outside the {}-byte piece",
                chunk.offset,
                reader.size()
            )));
        }

        let requested = self.requested + chunk.size;
        if requested > limit.limit {
            return Err(AuthError::LimitExceeded {
                requested,
                limit: limit.limit,
            }
            .into());
        }

        self.requested = requested;
        self.pending.push_back(chunk);
        Ok(())
    }

    /// Read the next chunk of at most `max_size` bytes, bounded by the
    /// allowance. `None` when nothing can be sent yet.
    pub async fn next_chunk(
        &mut self,
        max_size: u64,
    ) -> Result<Option<PieceChunk>, ProtocolError> {
        if !self.can_serve() {
            return Ok(None);
        }
        let (Some(reader), Some(front)) = (self.reader.as_mut(), self.pending.front_mut()) else {
            return Ok(None);
        };

        let size = front
            .size
            .min(self.allowance - self.served)
            .min(max_size.max(1));
        let offset = front.offset;
        let data = match reader.read_at(offset, size as usize).await {
            Ok(data) => data,
            Err(err) => {
                self.fail();
                return Err(err.into());
            }
        };

        front.offset += size;
        front.size -= size;
        if front.size == 0 {
            self.pending.pop_front();
        }
        self.served += size;

        Ok(Some(PieceChunk { offset, data }))
    }

    /// The uplink closed its side. Returns the bytes served.
    pub fn finish(&mut self) -> u64 {
        if let Some(limit) = &self.limit {
            debug!(
                "Download of piece {} finished: {} of {} requested bytes sent",
                limit.piece_id, self.served, self.requested
            );
        }
        self.state = SessionState::Done;
        self.reader = None;
        self._guard = None;
        self.served
    }

    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.reader = None;
        self.pending.clear();
        self._guard = None;
    }
}
