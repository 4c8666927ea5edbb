//! Periodic maintenance: expired piece collection and trash emptying.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use piecestore_storage::{ExpirationDb, Storage, StorageError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::verification::Verifier;

/// Call `tick` every `interval` until shutdown is signalled.
pub async fn run_chore<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("{name} chore started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("{name} chore received shutdown signal");
                    break;
                }
            }
            _ = interval.tick() => {
                trace!("{name} chore tick");
                tick().await;
            }
        }
    }
}

/// Deletes pieces whose recorded expiration has passed.
pub struct ExpirationCollector<S> {
    storage: Arc<S>,
    db: ExpirationDb,
    verifier: Arc<Verifier>,
    batch_size: usize,
}

impl<S: Storage> ExpirationCollector<S> {
    pub fn new(
        storage: Arc<S>,
        db: ExpirationDb,
        verifier: Arc<Verifier>,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            db,
            verifier,
            batch_size: batch_size.max(1),
        }
    }

    /// Delete every piece expired before `now`. Returns how many were removed.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        self.verifier.serials().prune(now);

        let mut collected = 0;
        loop {
            let expired = self.db.expired(now, self.batch_size).await?;
            if expired.is_empty() {
                break;
            }
            let batch = expired.len();
            let mut forgotten = 0;

            for piece_id in expired {
                match self.storage.delete(&piece_id).await {
                    Ok(()) => collected += 1,
                    Err(StorageError::NotFound(_)) => {
                        debug!("Expired piece {piece_id} was already gone");
                    }
                    Err(err) => {
                        // Keep the record so the next run retries.
                        warn!("Failed to delete expired piece {piece_id}: {err}");
                        continue;
                    }
                }
                self.db.delete(&piece_id).await?;
                forgotten += 1;
            }

            if batch < self.batch_size || forgotten == 0 {
                break;
            }
        }

        if collected > 0 {
            info!("Collected {collected} expired pieces");
        }
        Ok(collected)
    }

    pub async fn run(self, interval: Duration, shutdown: watch::Receiver<bool>) {
        let this = &self;
        run_chore("Expiration collector", interval, shutdown, move || async move {
            if let Err(err) = this.collect(Utc::now()).await {
                warn!("Expiration collection failed: {err}");
            }
        })
        .await;
    }
}

/// Permanently removes pieces that stayed in the trash long enough.
pub struct TrashChore<S> {
    storage: Arc<S>,
    trash_expiry: chrono::Duration,
}

impl<S: Storage> TrashChore<S> {
    pub fn new(storage: Arc<S>, trash_expiry: chrono::Duration) -> Self {
        Self {
            storage,
            trash_expiry,
        }
    }

    /// Empty pieces trashed more than `trash_expiry` before `now`.
    pub async fn empty(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let removed = self.storage.empty_trash(now - self.trash_expiry).await?;
        if !removed.is_empty() {
            info!("Emptied {} pieces from the trash", removed.len());
        }
        Ok(removed.len())
    }

    pub async fn run(self, interval: Duration, shutdown: watch::Receiver<bool>) {
        let this = &self;
        run_chore("Trash", interval, shutdown, move || async move {
            if let Err(err) = this.empty(Utc::now()).await {
                warn!("Emptying trash failed: {err}");
            }
        })
        .await;
    }
}
