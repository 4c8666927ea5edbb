//! Advisory registry of pieces with a transfer in progress.
//!
//! Nothing blocks on this set; background work such as retain consults it and
//! leaves registered pieces alone.

use std::sync::Arc;

use dashmap::DashMap;
use piecestore_core::PieceId;

#[derive(Debug, Default)]
pub struct InFlight {
    pieces: DashMap<PieceId, usize>,
}

impl InFlight {
    /// Register a transfer of `piece_id` until the guard is dropped.
    pub fn register(self: &Arc<Self>, piece_id: PieceId) -> InFlightGuard {
        *self.pieces.entry(piece_id).or_insert(0) += 1;
        InFlightGuard {
            registry: Arc::clone(self),
            piece_id,
        }
    }

    pub fn contains(&self, piece_id: &PieceId) -> bool {
        self.pieces.contains_key(piece_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlight>,
    piece_id: PieceId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.registry.pieces.get_mut(&self.piece_id) {
            *count = count.saturating_sub(1);
        }
        self.registry
            .pieces
            .remove_if(&self.piece_id, |_, count| *count == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_are_counted() {
        let in_flight = Arc::new(InFlight::default());
        let piece_id = PieceId::generate();

        let first = in_flight.register(piece_id);
        let second = in_flight.register(piece_id);
        assert!(in_flight.contains(&piece_id));

        drop(first);
        assert!(in_flight.contains(&piece_id));
        drop(second);
        assert!(!in_flight.contains(&piece_id));
        assert!(in_flight.is_empty());
    }
}
