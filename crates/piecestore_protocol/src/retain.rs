//! Garbage collection driven by satellite bloom filters.
//!
//! Retain requests are acknowledged as soon as they are queued. A single
//! worker sweeps the store one job at a time and moves every old piece that
//! is missing from the filter into the trash.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use piecestore_core::bloom::BloomFilter;
use piecestore_storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::inflight::InFlight;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetainStatus {
    /// Requests are acknowledged and ignored.
    Disabled,
    #[default]
    Enabled,
    /// Sweep and log, but trash nothing.
    Debug,
}

impl fmt::Display for RetainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetainStatus::Disabled => "disabled",
            RetainStatus::Enabled => "enabled",
            RetainStatus::Debug => "debug",
        };
        f.write_str(name)
    }
}

impl FromStr for RetainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(RetainStatus::Disabled),
            "enabled" => Ok(RetainStatus::Enabled),
            "debug" => Ok(RetainStatus::Debug),
            other => Err(format!("unknown retain status: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetainConfig {
    pub status: RetainStatus,
    /// Pieces younger than `creation_date - max_time_skew` are never touched.
    pub max_time_skew: Duration,
    pub queue_capacity: usize,
}

impl Default for RetainConfig {
    fn default() -> Self {
        Self {
            status: RetainStatus::Enabled,
            max_time_skew: Duration::hours(72),
            queue_capacity: 8,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetainJob {
    /// Only pieces created before this instant may be trashed.
    pub created_before: DateTime<Utc>,
    pub filter: BloomFilter,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetainStats {
    pub checked: usize,
    pub trashed: usize,
    pub skipped_in_flight: usize,
}

/// Handle used by the endpoint to hand jobs to the worker.
#[derive(Clone, Debug)]
pub struct RetainQueue {
    sender: mpsc::Sender<RetainJob>,
    config: RetainConfig,
}

impl RetainQueue {
    /// Queue a sweep for a request dated `creation_date`. Returns whether the
    /// job was accepted. A full queue drops the job.
    pub fn queue(&self, creation_date: DateTime<Utc>, filter: BloomFilter) -> bool {
        if self.config.status == RetainStatus::Disabled {
            debug!("Retain is disabled, ignoring request dated {creation_date}");
            return false;
        }

        let job = RetainJob {
            created_before: creation_date - self.config.max_time_skew,
            filter,
        };
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    "Retain queue is full, dropping job for pieces before {}",
                    job.created_before
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Retain worker is not running, dropping job");
                false
            }
        }
    }
}

pub struct RetainService<S> {
    storage: Arc<S>,
    in_flight: Arc<InFlight>,
    status: RetainStatus,
    receiver: mpsc::Receiver<RetainJob>,
    completed: watch::Sender<u64>,
}

impl<S: Storage> RetainService<S> {
    pub fn new(
        config: RetainConfig,
        storage: Arc<S>,
        in_flight: Arc<InFlight>,
    ) -> (Self, RetainQueue) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (completed, _) = watch::channel(0);
        let service = Self {
            storage,
            in_flight,
            status: config.status,
            receiver,
            completed,
        };
        (service, RetainQueue { sender, config })
    }

    /// Number of finished jobs, bumped after each sweep.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.completed.subscribe()
    }

    /// Process jobs until shutdown is signalled or every queue handle is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Retain service started ({})", self.status);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Retain service received shutdown signal");
                        break;
                    }
                }
                job = self.receiver.recv() => {
                    let Some(job) = job else { break };
                    match self.process(&job).await {
                        Ok(stats) => info!(
                            "Retain finished: {} checked, {} trashed, {} skipped in flight",
                            stats.checked, stats.trashed, stats.skipped_in_flight
                        ),
                        Err(err) => warn!("Retain sweep failed: {err}"),
                    }
                    self.completed.send_modify(|count| *count += 1);
                }
            }
        }
    }

    /// Sweep the store once for `job`.
    pub async fn process(&self, job: &RetainJob) -> Result<RetainStats, StorageError> {
        let mut stats = RetainStats::default();
        for piece in self.storage.list().await? {
            stats.checked += 1;
            if piece.header.creation_time >= job.created_before
                || job.filter.contains(&piece.piece_id)
            {
                continue;
            }
            if self.in_flight.contains(&piece.piece_id) {
                stats.skipped_in_flight += 1;
                continue;
            }

            if self.status == RetainStatus::Debug {
                debug!("Retain would trash piece {}", piece.piece_id);
            } else {
                match self.storage.trash(&piece.piece_id).await {
                    Ok(()) => stats.trashed += 1,
                    // Deleted while the sweep was running.
                    Err(StorageError::NotFound(_)) => {}
                    Err(err) => warn!("Failed to trash piece {}: {err}", piece.piece_id),
                }
            }
            tokio::task::yield_now().await;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use piecestore_core::{
        HashAlgorithm, NodeId, OrderLimit, PieceAction, PieceId, SerialNumber,
    };
    use piecestore_storage::{FormatVersion, MemoryStorage, PieceHeader};

    use super::*;

    fn day(n: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::days(n)
    }

    async fn put(storage: &MemoryStorage, created: DateTime<Utc>) -> PieceId {
        let piece_id = PieceId::generate();
        let mut writer = storage.writer(piece_id).await.unwrap();
        writer.write(b"piece").await.unwrap();
        writer
            .commit(PieceHeader {
                format_version: FormatVersion::V1,
                hash: HashAlgorithm::Sha256.digest(b"piece"),
                hash_algorithm: HashAlgorithm::Sha256,
                creation_time: created,
                signature: Vec::new(),
                order_limit: OrderLimit {
                    serial_number: SerialNumber::generate(),
                    satellite_id: NodeId::default(),
                    uplink_public_key: NodeId::default(),
                    storage_node_id: NodeId::default(),
                    piece_id,
                    limit: 5,
                    action: PieceAction::Put,
                    piece_expiration: None,
                    order_expiration: created + Duration::hours(1),
                    order_creation: created,
                    satellite_signature: Vec::new(),
                },
            })
            .await
            .unwrap();
        piece_id
    }

    fn build(
        status: RetainStatus,
        storage: &Arc<MemoryStorage>,
    ) -> (RetainService<MemoryStorage>, RetainQueue, Arc<InFlight>) {
        let in_flight = Arc::new(InFlight::default());
        let config = RetainConfig {
            status,
            max_time_skew: Duration::zero(),
            queue_capacity: 1,
        };
        let (service, queue) =
            RetainService::new(config, Arc::clone(storage), Arc::clone(&in_flight));
        (service, queue, in_flight)
    }

    #[tokio::test]
    async fn test_only_old_non_members_are_trashed() {
        let storage = Arc::new(MemoryStorage::new());
        let a = put(&storage, day(1)).await;
        let b = put(&storage, day(1)).await;
        let c = put(&storage, day(10)).await;

        let mut filter = BloomFilter::new(10, 0.0001);
        filter.add(&a);
        assert!(!filter.contains(&b));

        let (service, _, _) = build(RetainStatus::Enabled, &storage);
        let stats = service
            .process(&RetainJob {
                created_before: day(5),
                filter,
            })
            .await
            .unwrap();

        assert_eq!(stats.checked, 3);
        assert_eq!(stats.trashed, 1);
        assert!(storage.exists(&a).await.unwrap());
        assert!(!storage.exists(&b).await.unwrap());
        assert!(storage.exists(&c).await.unwrap());
        assert_eq!(storage.restore_trash().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_debug_mode_and_in_flight_pieces_are_left_alone() {
        let storage = Arc::new(MemoryStorage::new());
        let old = put(&storage, day(1)).await;
        let job = RetainJob {
            created_before: day(5),
            filter: BloomFilter::new(10, 0.0001),
        };

        let (service, _, _) = build(RetainStatus::Debug, &storage);
        assert_eq!(service.process(&job).await.unwrap().trashed, 0);
        assert!(storage.exists(&old).await.unwrap());

        let (service, _, in_flight) = build(RetainStatus::Enabled, &storage);
        let guard = in_flight.register(old);
        let stats = service.process(&job).await.unwrap();
        assert_eq!(stats.skipped_in_flight, 1);
        assert!(storage.exists(&old).await.unwrap());

        drop(guard);
        assert_eq!(service.process(&job).await.unwrap().trashed, 1);
    }

    #[tokio::test]
    async fn test_queue_drops_when_full_or_disabled() {
        let storage = Arc::new(MemoryStorage::new());
        let (_service, queue, _) = build(RetainStatus::Enabled, &storage);
        assert!(queue.queue(day(5), BloomFilter::new(1, 0.01)));
        assert!(!queue.queue(day(5), BloomFilter::new(1, 0.01)));

        let (_service, queue, _) = build(RetainStatus::Disabled, &storage);
        assert!(!queue.queue(day(5), BloomFilter::new(1, 0.01)));
    }

    #[tokio::test]
    async fn test_worker_processes_queued_jobs() {
        let storage = Arc::new(MemoryStorage::new());
        let doomed = put(&storage, day(1)).await;

        let (service, queue, _) = build(RetainStatus::Enabled, &storage);
        let mut completed = service.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(service.run(shutdown_rx));

        assert!(queue.queue(day(5), BloomFilter::new(10, 0.0001)));
        completed.changed().await.unwrap();
        assert!(!storage.exists(&doomed).await.unwrap());

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Debug".parse::<RetainStatus>().unwrap(), RetainStatus::Debug);
        assert_eq!(RetainStatus::default().to_string(), "enabled");
        assert!("sometimes".parse::<RetainStatus>().is_err());
    }
}
