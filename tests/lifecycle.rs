//! Lifecycle worker scenarios: expiry sweep, tier migration, cleanup.

mod common;

use std::sync::Arc;

use common::{create_user, spawn_app, TestApp};

use strata::config::LifecycleConfig;
use strata::datetime::{days_ms, now_millis};
use strata::events::EventSink;
use strata::file::{FileRepository, MigrationStatus};
use strata::storage::StorageTier;
use strata::upload::{InitRequest, SessionRepository, SessionStatus};
use strata::user::Role;
use strata::workers::{CleanupWorker, ExpiryWorker, MigrationWorker};
use strata::FileRecord;

async fn upload_file(app: &TestApp, user_id: i64, data: &[u8]) -> FileRecord {
    let init = app
        .upload
        .init(
            user_id,
            &InitRequest {
                filename: "lifecycle.bin".into(),
                total_size: data.len() as i64,
                mime_type: None,
                expected_hash: None,
                folder_id: None,
            },
        )
        .await
        .unwrap();
    for (index, chunk) in data.chunks(init.chunk_size as usize).enumerate() {
        app.upload
            .chunk(&init.session_id, index as u32, chunk, None)
            .await
            .unwrap();
    }
    app.upload.complete(&init.session_id, user_id).await.unwrap()
}

fn expiry_worker(app: &TestApp, config: &LifecycleConfig) -> ExpiryWorker {
    ExpiryWorker::new(
        app.db.pool().clone(),
        Arc::clone(&app.backend),
        Arc::clone(&app.volatile),
        app.quota.clone(),
        Arc::clone(&app.events) as Arc<dyn EventSink>,
        config,
    )
}

fn migration_worker(app: &TestApp, config: &LifecycleConfig) -> MigrationWorker {
    MigrationWorker::new(
        app.db.pool().clone(),
        Arc::clone(&app.backend),
        Arc::clone(&app.volatile),
        Arc::clone(&app.events) as Arc<dyn EventSink>,
        config,
    )
}

fn cleanup_worker(app: &TestApp, config: &LifecycleConfig) -> CleanupWorker {
    CleanupWorker::new(
        app.db.pool().clone(),
        Arc::clone(&app.backend),
        Arc::clone(&app.volatile),
        Arc::clone(&app.events) as Arc<dyn EventSink>,
        config,
    )
}

#[tokio::test]
async fn expiry_sweep_removes_expired_file() {
    let app = spawn_app(64).await;
    let user = create_user(&app, "exp@example.com", Role::Free).await;
    let file = upload_file(&app, user.id, &[7u8; 128]).await;

    // Force the deadline into the past.
    sqlx::query("UPDATE files SET expires_at = ? WHERE id = ?")
        .bind(now_millis() - 1_000)
        .bind(&file.id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let report = expiry_worker(&app, &LifecycleConfig::default()).run_once().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let swept = FileRepository::new(app.db.pool())
        .find_by_id(&file.id)
        .await
        .unwrap()
        .unwrap();
    assert!(swept.is_deleted);
    assert!(!app.backend.exists(&file.storage_key, StorageTier::Hot).await);

    let row = app.quota.row(user.id).await.unwrap();
    assert_eq!(row.used_storage, 0);
    assert_eq!(row.used_files, 0);
}

#[tokio::test]
async fn cold_file_promoted_after_five_downloads() {
    let app = spawn_app(64).await;
    let user = create_user(&app, "promo@example.com", Role::Free).await;
    let file = upload_file(&app, user.id, &[1u8; 64]).await;

    // Put the blob and the record on the cold tier, popular and recent:
    // five downloads, the last one a day ago, threshold five.
    app.backend
        .migrate(&file.storage_key, StorageTier::Hot, StorageTier::Cold)
        .await
        .unwrap();
    sqlx::query(
        "UPDATE files SET storage_tier = 'cold', downloads = 5, last_download_at = ? WHERE id = ?",
    )
    .bind(now_millis() - days_ms(1))
    .bind(&file.id)
    .execute(app.db.pool())
    .await
    .unwrap();

    let config = LifecycleConfig {
        cold_to_hot_downloads: 5,
        ..LifecycleConfig::default()
    };
    let report = migration_worker(&app, &config).run_once().await;
    assert_eq!(report.processed, 1);

    let promoted = FileRepository::new(app.db.pool())
        .find_by_id(&file.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promoted.storage_tier, StorageTier::Hot);
    assert_eq!(promoted.migration_status, MigrationStatus::Completed);
    assert!(app.backend.exists(&file.storage_key, StorageTier::Hot).await);
    assert!(!app.backend.exists(&file.storage_key, StorageTier::Cold).await);
}

#[tokio::test]
async fn stale_hot_file_demoted_and_survives_round_trip() {
    let app = spawn_app(64).await;
    let user = create_user(&app, "demote@example.com", Role::Free).await;
    let data = [3u8; 100];
    let file = upload_file(&app, user.id, &data).await;

    sqlx::query("UPDATE files SET last_access_at = ? WHERE id = ?")
        .bind(now_millis() - days_ms(45))
        .bind(&file.id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let config = LifecycleConfig {
        hot_to_cold_days: 30,
        ..LifecycleConfig::default()
    };
    let report = migration_worker(&app, &config).run_once().await;
    assert_eq!(report.processed, 1);

    // The content is intact on the cold tier and still downloadable.
    let demoted = FileRepository::new(app.db.pool())
        .find_by_id(&file.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(demoted.storage_tier, StorageTier::Cold);

    let body = app
        .backend
        .open_range(&file.storage_key, StorageTier::Cold, None, None)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(body, data);
}

#[tokio::test]
async fn cleanup_expires_stale_sessions_and_collects_orphans() {
    let app = spawn_app(64).await;
    let user = create_user(&app, "cleanup@example.com", Role::Free).await;

    // A session past its deadline with staged chunks.
    let init = app
        .upload
        .init(
            user.id,
            &InitRequest {
                filename: "stale.bin".into(),
                total_size: 128,
                mime_type: None,
                expected_hash: None,
                folder_id: None,
            },
        )
        .await
        .unwrap();
    app.upload
        .chunk(&init.session_id, 0, &[0u8; 64], None)
        .await
        .unwrap();
    sqlx::query("UPDATE upload_sessions SET expires_at = ? WHERE session_id = ?")
        .bind(now_millis() - 1_000)
        .bind(&init.session_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    // An orphan staging directory with no session behind it.
    app.backend
        .write_chunk("orphan-session", 0, b"junk")
        .await
        .unwrap();

    let config = LifecycleConfig {
        orphan_age_secs: 0,
        ..LifecycleConfig::default()
    };
    let report = cleanup_worker(&app, &config).run_once().await;
    assert!(report.processed >= 2);

    let session = SessionRepository::new(app.db.pool())
        .find(&init.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Expired);
    assert!(!app.backend.chunk_dir(&init.session_id).exists());
    assert!(!app.backend.chunk_dir("orphan-session").exists());
}

#[tokio::test]
async fn premium_files_never_expire_nor_demote() {
    let app = spawn_app(64).await;
    let user = create_user(&app, "vip@example.com", Role::Premium).await;
    let file = upload_file(&app, user.id, &[5u8; 64]).await;
    assert!(file.expires_at.is_none());

    sqlx::query("UPDATE files SET last_access_at = ? WHERE id = ?")
        .bind(now_millis() - days_ms(365))
        .bind(&file.id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let config = LifecycleConfig::default();
    assert_eq!(expiry_worker(&app, &config).run_once().await.processed, 0);
    assert_eq!(migration_worker(&app, &config).run_once().await.processed, 0);

    let untouched = FileRepository::new(app.db.pool())
        .find_by_id(&file.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!untouched.is_deleted);
    assert_eq!(untouched.storage_tier, StorageTier::Hot);
}
