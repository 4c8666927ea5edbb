//! Verification of order limits, orders and satellite-signed requests.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use piecestore_core::signing;
use piecestore_core::{NodeId, Order, OrderLimit, PieceAction, SerialNumber};
use serde::Serialize;
use tracing::debug;

use crate::error::AuthError;
use crate::message::SignedRequest;

/// Serial numbers tracked before expired ones are pruned.
const SERIALS_PRUNE_THRESHOLD: usize = 100_000;

/// Serial numbers of order limits that already started a session.
#[derive(Debug, Default)]
pub struct UsedSerials {
    serials: DashMap<SerialNumber, DateTime<Utc>>,
}

impl UsedSerials {
    /// Record `serial` until `expiration`. Returns `false` if it is already
    /// recorded and not yet expired.
    pub fn add(&self, serial: SerialNumber, expiration: DateTime<Utc>) -> bool {
        let now = Utc::now();
        if self.serials.len() > SERIALS_PRUNE_THRESHOLD {
            self.prune(now);
        }

        match self.serials.entry(serial) {
            Entry::Occupied(entry) if *entry.get() > now => false,
            Entry::Occupied(mut entry) => {
                entry.insert(expiration);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(expiration);
                true
            }
        }
    }

    /// Drop serials whose order limits expired before `now`.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.serials.len();
        self.serials.retain(|_, expiration| *expiration > now);
        let pruned = before.saturating_sub(self.serials.len());
        if pruned > 0 {
            debug!("Pruned {pruned} expired serial numbers");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

/// Checks everything a storage node must verify before it moves bytes.
#[derive(Debug)]
pub struct Verifier {
    node_id: NodeId,
    trusted: HashSet<NodeId>,
    max_time_skew: Duration,
    serials: UsedSerials,
}

impl Verifier {
    pub fn new(
        node_id: NodeId,
        trusted_satellites: impl IntoIterator<Item = NodeId>,
        max_time_skew: Duration,
    ) -> Self {
        Self {
            node_id,
            trusted: trusted_satellites.into_iter().collect(),
            max_time_skew,
            serials: UsedSerials::default(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_trusted(&self, satellite: &NodeId) -> bool {
        self.trusted.contains(satellite)
    }

    pub fn serials(&self) -> &UsedSerials {
        &self.serials
    }

    /// Verify an order limit opening a session. `allowed` decides which actions
    /// the operation accepts. The serial number is consumed on success.
    pub fn verify_order_limit(
        &self,
        limit: &OrderLimit,
        allowed: fn(PieceAction) -> bool,
    ) -> Result<(), AuthError> {
        let now = Utc::now();

        if !allowed(limit.action) {
            return Err(AuthError::WrongAction(limit.action));
        }
        if limit.storage_node_id != self.node_id {
            return Err(AuthError::WrongNode(limit.storage_node_id));
        }
        if limit.order_expiration <= now {
            return Err(AuthError::OrderExpired(limit.order_expiration));
        }
        if let Some(expiration) = limit.piece_expiration {
            if expiration <= now {
                return Err(AuthError::PieceExpired(expiration));
            }
        }
        if limit.order_creation > now + self.max_time_skew {
            return Err(AuthError::CreatedInFuture(limit.order_creation));
        }
        if !self.is_trusted(&limit.satellite_id) {
            return Err(AuthError::UntrustedSatellite(limit.satellite_id));
        }
        signing::verify(&limit.satellite_id, limit)?;

        if !self.serials.add(limit.serial_number, limit.order_expiration) {
            return Err(AuthError::SerialReused(limit.serial_number));
        }
        Ok(())
    }

    /// Verify an order against its limit. Amounts are cumulative and may not
    /// decrease.
    pub fn verify_order(
        &self,
        limit: &OrderLimit,
        order: &Order,
        previous_amount: u64,
    ) -> Result<(), AuthError> {
        if order.serial_number != limit.serial_number {
            return Err(AuthError::SerialMismatch {
                got: order.serial_number,
            });
        }
        if order.amount < previous_amount {
            return Err(AuthError::OrderDecreased {
                amount: order.amount,
                previous: previous_amount,
            });
        }
        if order.amount > limit.limit {
            return Err(AuthError::LimitExceeded {
                requested: order.amount,
                limit: limit.limit,
            });
        }
        signing::verify(&limit.uplink_public_key, order)?;
        Ok(())
    }

    /// Verify a request signed by a trusted satellite within the clock skew.
    pub fn verify_request<T: Serialize + Clone>(
        &self,
        request: &SignedRequest<T>,
    ) -> Result<(), AuthError> {
        if !self.is_trusted(&request.satellite_id) {
            return Err(AuthError::UntrustedSatellite(request.satellite_id));
        }
        let now = Utc::now();
        if request.issued_at > now + self.max_time_skew
            || request.issued_at < now - self.max_time_skew
        {
            return Err(AuthError::StaleRequest(request.issued_at));
        }
        signing::verify(&request.satellite_id, request)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use piecestore_core::{Identity, PieceId};

    use super::*;
    use crate::message::RestoreTrashRequest;

    struct Fixture {
        satellite: Identity,
        uplink: Identity,
        node: Identity,
        verifier: Verifier,
    }

    fn fixture() -> Fixture {
        let satellite = Identity::generate();
        let node = Identity::generate();
        let verifier = Verifier::new(node.node_id(), [satellite.node_id()], Duration::hours(1));
        Fixture {
            satellite,
            uplink: Identity::generate(),
            node,
            verifier,
        }
    }

    fn limit(f: &Fixture, action: PieceAction) -> OrderLimit {
        let now = Utc::now();
        OrderLimit {
            serial_number: SerialNumber::generate(),
            satellite_id: f.satellite.node_id(),
            uplink_public_key: f.uplink.node_id(),
            storage_node_id: f.node.node_id(),
            piece_id: PieceId::generate(),
            limit: 1000,
            action,
            piece_expiration: None,
            order_expiration: now + Duration::hours(1),
            order_creation: now,
            satellite_signature: Vec::new(),
        }
    }

    fn signed(f: &Fixture, limit: OrderLimit) -> OrderLimit {
        f.satellite.sign(limit).unwrap()
    }

    #[test]
    fn test_valid_limit_accepted_once() {
        let f = fixture();
        let limit = signed(&f, limit(&f, PieceAction::Put));
        f.verifier
            .verify_order_limit(&limit, PieceAction::is_upload)
            .unwrap();
        assert!(matches!(
            f.verifier
                .verify_order_limit(&limit, PieceAction::is_upload)
                .unwrap_err(),
            AuthError::SerialReused(_)
        ));
    }

    #[test]
    fn test_limit_rejections() {
        let f = fixture();

        let get = signed(&f, limit(&f, PieceAction::Get));
        assert!(matches!(
            f.verifier.verify_order_limit(&get, PieceAction::is_upload),
            Err(AuthError::WrongAction(PieceAction::Get))
        ));

        let mut other_node = limit(&f, PieceAction::Put);
        other_node.storage_node_id = Identity::generate().node_id();
        let other_node = signed(&f, other_node);
        assert!(matches!(
            f.verifier.verify_order_limit(&other_node, PieceAction::is_upload),
            Err(AuthError::WrongNode(_))
        ));

        let mut expired = limit(&f, PieceAction::Put);
        expired.order_expiration = Utc::now() - Duration::seconds(1);
        let expired = signed(&f, expired);
        assert!(matches!(
            f.verifier.verify_order_limit(&expired, PieceAction::is_upload),
            Err(AuthError::OrderExpired(_))
        ));

        let mut piece_expired = limit(&f, PieceAction::Put);
        piece_expired.piece_expiration = Some(Utc::now() - Duration::days(1));
        let piece_expired = signed(&f, piece_expired);
        assert!(matches!(
            f.verifier.verify_order_limit(&piece_expired, PieceAction::is_upload),
            Err(AuthError::PieceExpired(_))
        ));

        let mut future = limit(&f, PieceAction::Put);
        future.order_creation = Utc::now() + Duration::hours(2);
        let future = signed(&f, future);
        assert!(matches!(
            f.verifier.verify_order_limit(&future, PieceAction::is_upload),
            Err(AuthError::CreatedInFuture(_))
        ));

        let untrusted = Identity::generate()
            .sign(OrderLimit {
                satellite_id: Identity::generate().node_id(),
                ..limit(&f, PieceAction::Put)
            })
            .unwrap();
        assert!(matches!(
            f.verifier.verify_order_limit(&untrusted, PieceAction::is_upload),
            Err(AuthError::UntrustedSatellite(_))
        ));

        let mut tampered = signed(&f, limit(&f, PieceAction::Put));
        tampered.limit += 1;
        assert!(matches!(
            f.verifier.verify_order_limit(&tampered, PieceAction::is_upload),
            Err(AuthError::Signature(_))
        ));

        // A refused limit does not burn its serial number.
        let fixed = signed(&f, tampered);
        f.verifier
            .verify_order_limit(&fixed, PieceAction::is_upload)
            .unwrap();
    }

    #[test]
    fn test_order_checks() {
        let f = fixture();
        let limit = signed(&f, limit(&f, PieceAction::Put));
        let order = |amount: u64| {
            f.uplink
                .sign(Order {
                    serial_number: limit.serial_number,
                    amount,
                    uplink_signature: Vec::new(),
                })
                .unwrap()
        };

        f.verifier.verify_order(&limit, &order(500), 0).unwrap();
        f.verifier.verify_order(&limit, &order(500), 500).unwrap();
        assert!(matches!(
            f.verifier.verify_order(&limit, &order(400), 500),
            Err(AuthError::OrderDecreased { amount: 400, previous: 500 })
        ));
        assert!(matches!(
            f.verifier.verify_order(&limit, &order(1001), 0),
            Err(AuthError::LimitExceeded { requested: 1001, limit: 1000 })
        ));

        let foreign = f
            .uplink
            .sign(Order {
                serial_number: SerialNumber::generate(),
                amount: 10,
                uplink_signature: Vec::new(),
            })
            .unwrap();
        assert!(matches!(
            f.verifier.verify_order(&limit, &foreign, 0),
            Err(AuthError::SerialMismatch { .. })
        ));

        let forged = f
            .satellite
            .sign(Order {
                serial_number: limit.serial_number,
                amount: 10,
                uplink_signature: Vec::new(),
            })
            .unwrap();
        assert!(matches!(
            f.verifier.verify_order(&limit, &forged, 0),
            Err(AuthError::Signature(_))
        ));
    }

    #[test]
    fn test_signed_request_checks() {
        let f = fixture();
        let request = SignedRequest::new(&f.satellite, RestoreTrashRequest).unwrap();
        f.verifier.verify_request(&request).unwrap();

        let untrusted = SignedRequest::new(&f.uplink, RestoreTrashRequest).unwrap();
        assert!(matches!(
            f.verifier.verify_request(&untrusted),
            Err(AuthError::UntrustedSatellite(_))
        ));

        let stale = f
            .satellite
            .sign(SignedRequest {
                issued_at: Utc::now() - Duration::hours(3),
                ..request.clone()
            })
            .unwrap();
        assert!(matches!(
            f.verifier.verify_request(&stale),
            Err(AuthError::StaleRequest(_))
        ));
    }

    #[test]
    fn test_used_serials_expire() {
        let serials = UsedSerials::default();
        let serial = SerialNumber::generate();
        let now = Utc::now();

        assert!(serials.add(serial, now - Duration::seconds(1)));
        // Expired entries can be reused.
        assert!(serials.add(serial, now + Duration::hours(1)));
        assert!(!serials.add(serial, now + Duration::hours(1)));

        serials.add(SerialNumber::generate(), now - Duration::seconds(1));
        assert_eq!(serials.prune(Utc::now()), 1);
        assert_eq!(serials.len(), 1);
    }
}
