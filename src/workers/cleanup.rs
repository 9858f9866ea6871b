//! Cleanup worker: stale sessions, orphaned chunk directories, and the
//! terminal-session purge.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::LifecycleConfig;
use crate::datetime::{days_ms, now_millis};
use crate::events::{Event, EventSink};
use crate::storage::StorageBackend;
use crate::upload::{SessionRepository, SessionStatus};
use crate::volatile::{keys, VolatileStore};

use super::{spawn_periodic, WorkerHandle, WorkerReport};

/// Three sweeps per tick:
/// 1. live sessions past their deadline — chunks deleted, marked expired;
/// 2. `temp/<session>` directories whose session is gone or terminal and
///    whose mtime is old enough — removed (the crash-recovery path);
/// 3. terminal session records idle past the grace window — purged.
pub struct CleanupWorker {
    pool: SqlitePool,
    backend: Arc<StorageBackend>,
    volatile: Arc<VolatileStore>,
    events: Arc<dyn EventSink>,
    batch_size: u32,
    orphan_age: Duration,
    session_purge_days: i64,
    tick: Duration,
}

impl CleanupWorker {
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
            batch_size: config.batch_size,
            orphan_age: Duration::from_secs(config.orphan_age_secs),
            session_purge_days: config.session_purge_days,
            tick: Duration::from_secs(config.tick_secs),
        }
    }

    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let tick = self.tick;
        let worker = self;
        spawn_periodic("cleanup", tick, move || {
            let worker = Arc::clone(&worker);
            async move {
                worker.run_once().await;
            }
        })
    }

    pub async fn run_once(&self) -> WorkerReport {
        let mut report = WorkerReport::default();
        self.sweep_expired_sessions(&mut report).await;
        self.sweep_orphan_chunks(&mut report).await;
        self.purge_terminal_sessions(&mut report).await;

        if report.did_work() {
            info!(
                processed = report.processed,
                failed = report.failed,
                "cleanup pass finished"
            );
        }
        report
    }

    async fn sweep_expired_sessions(&self, report: &mut WorkerReport) {
        let sessions = SessionRepository::new(&self.pool);
        let batch = match sessions
            .expired_live_batch(now_millis(), self.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "expired session query failed");
                report.failed += 1;
                return;
            }
        };

        for session in batch {
            let swept = async {
                self.backend.delete_chunks(&session.session_id).await?;
                sessions
                    .set_status(&session.session_id, SessionStatus::Expired, None)
                    .await?;
                Ok::<(), crate::StrataError>(())
            }
            .await;

            match swept {
                Ok(()) => {
                    for prefix in [keys::UPLOAD_SESSION, keys::UPLOAD_CHUNKS] {
                        if let Err(e) = self
                            .volatile
                            .delete(&format!("{prefix}{}", session.session_id))
                        {
                            warn!(session_id = %session.session_id, error = %e, "cache eviction skipped");
                        }
                    }
                    self.events.emit(&Event::SessionSwept {
                        session_id: session.session_id.clone(),
                    });
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "session sweep failed");
                    report.failed += 1;
                }
            }
        }
    }

    async fn sweep_orphan_chunks(&self, report: &mut WorkerReport) {
        let sessions = SessionRepository::new(&self.pool);
        let staged = match self.backend.list_chunk_sessions().await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, "chunk directory scan failed");
                report.failed += 1;
                return;
            }
        };

        for (session_id, mtime) in staged {
            let age = SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            if age < self.orphan_age {
                continue;
            }

            let orphaned = match sessions.find(&session_id).await {
                Ok(None) => true,
                Ok(Some(session)) => session.status.is_terminal(),
                Err(e) => {
                    warn!(%session_id, error = %e, "orphan check failed");
                    report.failed += 1;
                    continue;
                }
            };
            if !orphaned {
                continue;
            }

            match self.backend.delete_chunks(&session_id).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(%session_id, error = %e, "orphan removal failed");
                    report.failed += 1;
                }
            }
        }
    }

    async fn purge_terminal_sessions(&self, report: &mut WorkerReport) {
        let cutoff = now_millis() - days_ms(self.session_purge_days);
        match SessionRepository::new(&self.pool)
            .purge_terminal_before(cutoff)
            .await
        {
            Ok(purged) => report.processed += purged as u32,
            Err(e) => {
                warn!(error = %e, "terminal session purge failed");
                report.failed += 1;
            }
        }
    }
}
