//! Per-stream transfer sessions.
//!
//! A session is a state machine fed one request at a time. It owns the order
//! limit, running offset and hash of one transfer and is discarded when the
//! stream ends. Sessions know nothing about the transport, so they can be
//! driven directly in tests.

use std::sync::Arc;

use piecestore_core::Identity;
use piecestore_storage::Storage;

use crate::inflight::InFlight;
use crate::verification::Verifier;

pub mod download;
pub mod upload;

pub use download::DownloadSession;
pub use upload::UploadSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingLimit,
    Active,
    Finalizing,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

/// Shared node state every session needs.
pub struct SessionContext<S> {
    pub storage: Arc<S>,
    pub verifier: Arc<Verifier>,
    pub identity: Arc<Identity>,
    pub in_flight: Arc<InFlight>,
}

impl<S> Clone for SessionContext<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            verifier: Arc::clone(&self.verifier),
            identity: Arc::clone(&self.identity),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S: Storage> SessionContext<S> {
    pub fn new(storage: Arc<S>, verifier: Arc<Verifier>, identity: Arc<Identity>) -> Self {
        Self {
            storage,
            verifier,
            identity,
            in_flight: Arc::new(InFlight::default()),
        }
    }
}
