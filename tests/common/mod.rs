//! Shared fixtures for integration tests.

use std::sync::Arc;

use tempfile::TempDir;

use strata::config::{DownloadConfig, QuotaConfig, UploadConfig};
use strata::events::{EventSink, MemoryEventSink};
use strata::quota::QuotaAccountant;
use strata::storage::StorageBackend;
use strata::upload::UploadEngine;
use strata::user::{NewUser, Role, User, UserRepository};
use strata::volatile::VolatileStore;
use strata::{Database, DownloadEngine};

/// A wired-together service core over an in-memory database and a
/// temporary object directory.
pub struct TestApp {
    pub db: Database,
    pub backend: Arc<StorageBackend>,
    pub volatile: Arc<VolatileStore>,
    pub quota: QuotaAccountant,
    pub upload: UploadEngine,
    pub download: DownloadEngine,
    pub events: Arc<MemoryEventSink>,
    _dir: TempDir,
}

/// Build the core with a given chunk size and free-tier expiry of 5 days.
pub async fn spawn_app(chunk_size: u64) -> TestApp {
    let db = Database::open_in_memory().await.unwrap();
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(StorageBackend::new(dir.path()).unwrap());
    let volatile = Arc::new(VolatileStore::new());
    let events = Arc::new(MemoryEventSink::new());
    let quota = QuotaAccountant::new(db.pool().clone(), QuotaConfig::default());

    let upload = UploadEngine::new(
        db.pool().clone(),
        Arc::clone(&backend),
        Arc::clone(&volatile),
        quota.clone(),
        Arc::clone(&events) as Arc<dyn EventSink>,
        &UploadConfig {
            chunk_size,
            session_ttl_secs: 3600,
        },
        5,
    );
    let download = DownloadEngine::new(
        db.pool().clone(),
        Arc::clone(&backend),
        Arc::clone(&volatile),
        quota.clone(),
        Arc::clone(&events) as Arc<dyn EventSink>,
        &DownloadConfig::default(),
    );

    TestApp {
        db,
        backend,
        volatile,
        quota,
        upload,
        download,
        events,
        _dir: dir,
    }
}

pub async fn create_user(app: &TestApp, email: &str, role: Role) -> User {
    UserRepository::new(app.db.pool())
        .create(&NewUser::new(email, "password-123").with_role(role))
        .await
        .unwrap()
}
