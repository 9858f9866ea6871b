//! Background lifecycle workers.
//!
//! Three periodic coordinators share one harness: expiry sweeping, tier
//! migration, and session/chunk cleanup. Every worker exposes `run_once`
//! for direct invocation and `start` for the interval loop; per-item
//! failures are counted and logged, never fatal to the batch or the
//! process.

mod cleanup;
mod expiry;
mod migration;

pub use cleanup::CleanupWorker;
pub use expiry::ExpiryWorker;
pub use migration::MigrationWorker;

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-tick outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u32,
    pub failed: u32,
}

impl WorkerReport {
    pub fn did_work(&self) -> bool {
        self.processed > 0 || self.failed > 0
    }
}

/// Handle to a started worker loop.
pub struct WorkerHandle {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Cancel the loop and wait for the current tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
        info!("{} worker stopped", self.name);
    }
}

/// Spawn the shared interval loop around a tick function.
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    tick: Duration,
    tick_fn: F,
) -> WorkerHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let token = CancellationToken::new();
    let loop_token = token.clone();

    let handle = tokio::spawn(async move {
        info!("{} worker started (tick {}s)", name, tick.as_secs());
        let mut timer = interval(tick);
        // The first tick fires immediately; skip it so start() does not
        // race the caller's setup.
        timer.tick().await;
        loop {
            tokio::select! {
                _ = loop_token.cancelled() => break,
                _ = timer.tick() => tick_fn().await,
            }
        }
    });

    WorkerHandle {
        name,
        token,
        handle,
    }
}
