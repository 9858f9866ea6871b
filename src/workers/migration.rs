//! Tier migrator: demotes stale hot files, promotes popular cold ones.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::LifecycleConfig;
use crate::datetime::{days_ms, now_millis};
use crate::events::{Event, EventSink};
use crate::file::{FileRecord, FileRepository, MigrationStatus};
use crate::storage::{StorageBackend, StorageTier};
use crate::volatile::{keys, VolatileStore};

use super::{spawn_periodic, WorkerHandle, WorkerReport};

/// Two passes per tick: hot files untouched for `hot_to_cold_days` move
/// down (premium and admin owners are exempt); cold files with
/// `cold_to_hot_downloads` recent downloads move back up.
pub struct MigrationWorker {
    pool: SqlitePool,
    backend: Arc<StorageBackend>,
    volatile: Arc<VolatileStore>,
    events: Arc<dyn EventSink>,
    hot_to_cold_days: i64,
    cold_to_hot_downloads: i64,
    hot_window_days: i64,
    batch_size: u32,
    tick: Duration,
}

impl MigrationWorker {
    pub fn new(
        pool: SqlitePool,
        backend: Arc<StorageBackend>,
        volatile: Arc<VolatileStore>,
        events: Arc<dyn EventSink>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            pool,
            backend,
            volatile,
            events,
            hot_to_cold_days: config.hot_to_cold_days,
            cold_to_hot_downloads: config.cold_to_hot_downloads,
            hot_window_days: config.hot_window_days,
            batch_size: config.batch_size,
            tick: Duration::from_secs(config.tick_secs),
        }
    }

    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let tick = self.tick;
        let worker = self;
        spawn_periodic("migration", tick, move || {
            let worker = Arc::clone(&worker);
            async move {
                worker.run_once().await;
            }
        })
    }

    /// One demotion pass and one promotion pass.
    pub async fn run_once(&self) -> WorkerReport {
        let mut report = WorkerReport::default();
        let files = FileRepository::new(&self.pool);
        let now = now_millis();

        let cold_candidates = files
            .cold_candidates(now - days_ms(self.hot_to_cold_days), self.batch_size)
            .await;
        match cold_candidates {
            Ok(batch) => {
                for file in batch {
                    self.migrate_one(&file, StorageTier::Cold, &mut report).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "cold candidate query failed");
                report.failed += 1;
            }
        }

        let hot_candidates = files
            .hot_candidates(
                self.cold_to_hot_downloads,
                now - days_ms(self.hot_window_days),
                self.batch_size,
            )
            .await;
        match hot_candidates {
            Ok(batch) => {
                for file in batch {
                    self.migrate_one(&file, StorageTier::Hot, &mut report).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "hot candidate query failed");
                report.failed += 1;
            }
        }

        if report.did_work() {
            info!(
                processed = report.processed,
                failed = report.failed,
                "migration pass finished"
            );
        }
        report
    }

    /// Migrate one file. The record is flagged in_progress for the
    /// duration; a backend failure records `failed` and the batch moves on.
    async fn migrate_one(
        &self,
        file: &FileRecord,
        target: StorageTier,
        report: &mut WorkerReport,
    ) {
        let files = FileRepository::new(&self.pool);
        let source = file.storage_tier;

        if let Err(e) = files
            .set_migration_status(&file.id, MigrationStatus::InProgress)
            .await
        {
            warn!(file_id = %file.id, error = %e, "migration flagging failed");
            report.failed += 1;
            return;
        }

        match self.backend.migrate(&file.storage_key, source, target).await {
            Ok(()) => {
                if let Err(e) = files
                    .finish_migration(&file.id, target, MigrationStatus::Completed)
                    .await
                {
                    warn!(file_id = %file.id, error = %e, "migration bookkeeping failed");
                    report.failed += 1;
                    return;
                }
                // Cached metadata still points at the old tier.
                if let Err(e) = self
                    .volatile
                    .delete(&format!("{}{}", keys::FILE_META, file.id))
                {
                    warn!(file_id = %file.id, error = %e, "cache invalidation skipped");
                }
                self.events.emit(&Event::FileMigrated {
                    file_id: file.id.clone(),
                    from: source.as_str(),
                    to: target.as_str(),
                });
                report.processed += 1;
            }
            Err(e) => {
                if let Err(status_err) = files
                    .set_migration_status(&file.id, MigrationStatus::Failed)
                    .await
                {
                    warn!(file_id = %file.id, error = %status_err, "failure bookkeeping failed");
                }
                self.events.emit(&Event::MigrationFailed {
                    file_id: file.id.clone(),
                    error: e.to_string(),
                });
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::db::Database;
    use crate::events::MemoryEventSink;
    use crate::file::NewFile;
    use crate::user::{NewUser, Role, UserRepository};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Fixture {
        db: Database,
        _dir: TempDir,
        backend: Arc<StorageBackend>,
        events: Arc<MemoryEventSink>,
        worker: MigrationWorker,
        free_id: i64,
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StorageBackend::new(dir.path()).unwrap());
        let volatile = Arc::new(VolatileStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let user = UserRepository::new(db.pool())
            .create(&NewUser::new("mig@example.com", "password1"))
            .await
            .unwrap();

        let config = LifecycleConfig {
            hot_to_cold_days: 30,
            cold_to_hot_downloads: 5,
            hot_window_days: 7,
            ..LifecycleConfig::default()
        };
        let worker = MigrationWorker::new(
            db.pool().clone(),
            Arc::clone(&backend),
            volatile,
            Arc::clone(&events) as Arc<dyn EventSink>,
            &config,
        );

        Fixture {
            db,
            _dir: dir,
            backend,
            events,
            worker,
            free_id: user.id,
        }
    }

    async fn store_blob(fx: &Fixture, key: &str, tier: StorageTier) {
        fx.backend.write_chunk("seed", 0, b"blobdata").await.unwrap();
        fx.backend.assemble_chunks("seed", key, 1, tier).await.unwrap();
        fx.backend.delete_chunks("seed").await.unwrap();
    }

    async fn insert_file(fx: &Fixture, user_id: i64, key: &str, tier: StorageTier) -> FileRecord {
        let file = FileRepository::new(fx.db.pool())
            .insert(&NewFile {
                user_id,
                folder_id: None,
                storage_key: key.to_string(),
                original_name: format!("{key}.bin"),
                mime_type: "application/octet-stream".into(),
                size: 8,
                hash: "h".into(),
                storage_tier: StorageTier::Hot,
                expires_at: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        sqlx::query("UPDATE files SET storage_tier = ? WHERE id = ?")
            .bind(tier.as_str())
            .bind(&file.id)
            .execute(fx.db.pool())
            .await
            .unwrap();
        FileRepository::new(fx.db.pool())
            .find_by_id(&file.id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_demotes_stale_hot_file() {
        let fx = setup().await;
        store_blob(&fx, "stale.bin", StorageTier::Hot).await;
        let file = insert_file(&fx, fx.free_id, "stale.bin", StorageTier::Hot).await;
        // Last touched 60 days ago.
        sqlx::query("UPDATE files SET last_access_at = ? WHERE id = ?")
            .bind(now_millis() - days_ms(60))
            .bind(&file.id)
            .execute(fx.db.pool())
            .await
            .unwrap();

        let report = fx.worker.run_once().await;
        assert_eq!(report.processed, 1);

        let fresh = FileRepository::new(fx.db.pool())
            .find_by_id(&file.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.storage_tier, StorageTier::Cold);
        assert_eq!(fresh.migration_status, MigrationStatus::Completed);
        assert!(fresh.last_migration_at.is_some());
        assert!(fx.backend.exists("stale.bin", StorageTier::Cold).await);
        assert!(!fx.backend.exists("stale.bin", StorageTier::Hot).await);
    }

    #[tokio::test]
    async fn test_premium_owner_exempt_from_demotion() {
        let fx = setup().await;
        let premium = UserRepository::new(fx.db.pool())
            .create(&NewUser::new("premium@example.com", "password1").with_role(Role::Premium))
            .await
            .unwrap();
        store_blob(&fx, "prem.bin", StorageTier::Hot).await;
        let file = insert_file(&fx, premium.id, "prem.bin", StorageTier::Hot).await;
        sqlx::query("UPDATE files SET last_access_at = ? WHERE id = ?")
            .bind(now_millis() - days_ms(60))
            .bind(&file.id)
            .execute(fx.db.pool())
            .await
            .unwrap();

        let report = fx.worker.run_once().await;
        assert_eq!(report.processed, 0);
        assert!(fx.backend.exists("prem.bin", StorageTier::Hot).await);
    }

    #[tokio::test]
    async fn test_promotes_popular_cold_file() {
        let fx = setup().await;
        store_blob(&fx, "pop.bin", StorageTier::Cold).await;
        let file = insert_file(&fx, fx.free_id, "pop.bin", StorageTier::Cold).await;
        sqlx::query(
            "UPDATE files SET downloads = 5, last_download_at = ?, last_access_at = ? WHERE id = ?",
        )
        .bind(now_millis() - days_ms(1))
        .bind(now_millis())
        .bind(&file.id)
        .execute(fx.db.pool())
        .await
        .unwrap();

        let report = fx.worker.run_once().await;
        assert_eq!(report.processed, 1);

        let fresh = FileRepository::new(fx.db.pool())
            .find_by_id(&file.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.storage_tier, StorageTier::Hot);
        assert!(fx.backend.exists("pop.bin", StorageTier::Hot).await);
        assert!(!fx.backend.exists("pop.bin", StorageTier::Cold).await);

        assert!(fx
            .events
            .events()
            .iter()
            .any(|e| matches!(e, Event::FileMigrated { from: "cold", to: "hot", .. })));
    }

    #[tokio::test]
    async fn test_stale_cold_download_not_promoted() {
        let fx = setup().await;
        store_blob(&fx, "old.bin", StorageTier::Cold).await;
        let file = insert_file(&fx, fx.free_id, "old.bin", StorageTier::Cold).await;
        // Popular once, but not this week.
        sqlx::query(
            "UPDATE files SET downloads = 50, last_download_at = ?, last_access_at = ? WHERE id = ?",
        )
        .bind(now_millis() - days_ms(30))
        .bind(now_millis())
        .bind(&file.id)
        .execute(fx.db.pool())
        .await
        .unwrap();

        let report = fx.worker.run_once().await;
        assert_eq!(report.processed, 0);
        assert!(fx.backend.exists("old.bin", StorageTier::Cold).await);
    }

    #[tokio::test]
    async fn test_missing_blob_marks_failed_and_continues() {
        let fx = setup().await;
        // Candidate with no blob behind it.
        let broken = insert_file(&fx, fx.free_id, "missing.bin", StorageTier::Hot).await;
        sqlx::query("UPDATE files SET last_access_at = ? WHERE id = ?")
            .bind(now_millis() - days_ms(60))
            .bind(&broken.id)
            .execute(fx.db.pool())
            .await
            .unwrap();

        // A healthy candidate behind it in the same batch.
        store_blob(&fx, "okay.bin", StorageTier::Hot).await;
        let healthy = insert_file(&fx, fx.free_id, "okay.bin", StorageTier::Hot).await;
        sqlx::query("UPDATE files SET last_access_at = ? WHERE id = ?")
            .bind(now_millis() - days_ms(59))
            .bind(&healthy.id)
            .execute(fx.db.pool())
            .await
            .unwrap();

        let report = fx.worker.run_once().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);

        let broken_fresh = FileRepository::new(fx.db.pool())
            .find_by_id(&broken.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broken_fresh.migration_status, MigrationStatus::Failed);
        // Tier unchanged on failure.
        assert_eq!(broken_fresh.storage_tier, StorageTier::Hot);

        assert!(fx.backend.exists("okay.bin", StorageTier::Cold).await);
    }

    #[tokio::test]
    async fn test_in_progress_not_repicked() {
        let fx = setup().await;
        store_blob(&fx, "busy.bin", StorageTier::Hot).await;
        let file = insert_file(&fx, fx.free_id, "busy.bin", StorageTier::Hot).await;
        sqlx::query(
            "UPDATE files SET last_access_at = ?, migration_status = 'in_progress' WHERE id = ?",
        )
        .bind(now_millis() - days_ms(60))
        .bind(&file.id)
        .execute(fx.db.pool())
        .await
        .unwrap();

        let report = fx.worker.run_once().await;
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 0);
    }
}
