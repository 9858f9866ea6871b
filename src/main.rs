use std::sync::Arc;

use tracing::{error, info};

use strata::config::Config;
use strata::events::{EventSink, LogEventSink};
use strata::quota::QuotaAccountant;
use strata::storage::StorageBackend;
use strata::volatile::VolatileStore;
use strata::workers::{CleanupWorker, ExpiryWorker, MigrationWorker};
use strata::Database;

fn main() {
    let config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    }

    if let Err(e) = strata::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!("strata storage service starting");

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(config)) {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> strata::Result<()> {
    let db = Database::open(&config.database.path, config.database.pool_size).await?;
    info!("database opened at {}", config.database.path);

    let backend = Arc::new(StorageBackend::new(&config.storage.base_path)?);
    backend.health_check().await?;
    info!("storage backend ready at {}", config.storage.base_path);

    let volatile = Arc::new(VolatileStore::new());
    let events: Arc<dyn EventSink> = Arc::new(LogEventSink);
    let quota = QuotaAccountant::new(db.pool().clone(), config.quota.clone());

    let expiry = Arc::new(ExpiryWorker::new(
        db.pool().clone(),
        Arc::clone(&backend),
        Arc::clone(&volatile),
        quota.clone(),
        Arc::clone(&events),
        &config.lifecycle,
    ));
    let migration = Arc::new(MigrationWorker::new(
        db.pool().clone(),
        Arc::clone(&backend),
        Arc::clone(&volatile),
        Arc::clone(&events),
        &config.lifecycle,
    ));
    let cleanup = Arc::new(CleanupWorker::new(
        db.pool().clone(),
        Arc::clone(&backend),
        Arc::clone(&volatile),
        Arc::clone(&events),
        &config.lifecycle,
    ));

    let handles = vec![expiry.start(), migration.start(), cleanup.start()];
    info!(
        "lifecycle workers started (tick {}s, batch {})",
        config.lifecycle.tick_secs, config.lifecycle.batch_size
    );
    info!("Press Ctrl+C to stop");

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping workers");

    for handle in handles {
        handle.stop().await;
    }
    db.close().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
