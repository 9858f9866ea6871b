//! Expiry sweeper: removes files whose deadline has passed.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::LifecycleConfig;
use crate::datetime::now_millis;
use crate::events::{Event, EventSink};
use crate::file::FileRepository;
use crate::quota::QuotaAccountant;
use crate::storage::StorageBackend;
use crate::user::UserRepository;
use crate::volatile::{keys, VolatileStore};

use super::{spawn_periodic, WorkerHandle, WorkerReport};

/// Sweeps files with `expires_at <= now`: blob deleted, record
/// soft-deleted, quota released, metadata cache invalidated.
pub struct ExpiryWorker {
    pool: SqlitePool,
    backend: Arc<StorageBackend>,
    volatile: Arc<VolatileStore>,
    quota: QuotaAccountant,
    events: Arc<dyn EventSink>,
    batch_size: u32,
    tick: Duration,
}

impl ExpiryWorker {
    pub fn new(
        pool: SqlitePool,
        backend: Arc<StorageBackend>,
        volatile: Arc<VolatileStore>,
        quota: QuotaAccountant,
        events: Arc<dyn EventSink>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            pool,
            backend,
            volatile,
            quota,
            events,
            batch_size: config.batch_size,
            tick: Duration::from_secs(config.tick_secs),
        }
    }

    /// Run the interval loop until stopped.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let tick = self.tick;
        let worker = self;
        spawn_periodic("expiry", tick, move || {
            let worker = Arc::clone(&worker);
            async move {
                worker.run_once().await;
            }
        })
    }

    /// Process one batch of expired files, oldest deadline first.
    pub async fn run_once(&self) -> WorkerReport {
        let mut report = WorkerReport::default();
        let files = FileRepository::new(&self.pool);
        let users = UserRepository::new(&self.pool);

        let batch = match files.expired_batch(now_millis(), self.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "expiry sweep query failed");
                report.failed += 1;
                return report;
            }
        };

        for file in batch {
            let swept = async {
                self.backend
                    .delete(&file.storage_key, file.storage_tier)
                    .await?;
                files.soft_delete(&file.id).await?;
                if let Some(owner) = users.find_by_id(file.user_id).await? {
                    self.quota.remove_file(&owner.profile(), file.size).await?;
                }
                Ok::<(), crate::StrataError>(())
            }
            .await;

            match swept {
                Ok(()) => {
                    if let Err(e) = self
                        .volatile
                        .delete(&format!("{}{}", keys::FILE_META, file.id))
                    {
                        warn!(file_id = %file.id, error = %e, "cache invalidation skipped");
                    }
                    self.events.emit(&Event::FileExpired {
                        file_id: file.id.clone(),
                        user_id: file.user_id,
                        size: file.size,
                    });
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(file_id = %file.id, error = %e, "expiry sweep item failed");
                    report.failed += 1;
                }
            }
        }

        if report.did_work() {
            info!(
                processed = report.processed,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        report
    }
}
