//! Structured domain events.
//!
//! The core reports noteworthy state changes through [`EventSink`]; the
//! default sink forwards them to `tracing`. Surfaces that want metrics can
//! install their own sink at the composition root.

use std::sync::Mutex;

use tracing::{info, warn};

/// A domain event emitted by the core.
#[derive(Debug, Clone)]
pub enum Event {
    UploadSessionStarted {
        session_id: String,
        user_id: i64,
        total_chunks: u32,
    },
    UploadCompleted {
        session_id: String,
        file_id: String,
        user_id: i64,
        size: i64,
    },
    UploadFailed {
        session_id: String,
        code: &'static str,
    },
    DownloadServed {
        file_id: String,
        user_id: Option<i64>,
        bytes: u64,
        ranged: bool,
    },
    FileExpired {
        file_id: String,
        user_id: i64,
        size: i64,
    },
    FileMigrated {
        file_id: String,
        from: &'static str,
        to: &'static str,
    },
    MigrationFailed {
        file_id: String,
        error: String,
    },
    SessionSwept {
        session_id: String,
    },
    RateLimitRejected {
        limit_type: &'static str,
        identifier: String,
    },
    AbuseBlocked {
        ip: String,
    },
}

/// Sink for domain events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Default sink: structured tracing output.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::UploadSessionStarted {
                session_id,
                user_id,
                total_chunks,
            } => info!(%session_id, user_id, total_chunks, "upload session started"),
            Event::UploadCompleted {
                session_id,
                file_id,
                user_id,
                size,
            } => info!(%session_id, %file_id, user_id, size, "upload completed"),
            Event::UploadFailed { session_id, code } => {
                warn!(%session_id, code, "upload failed")
            }
            Event::DownloadServed {
                file_id,
                user_id,
                bytes,
                ranged,
            } => info!(%file_id, ?user_id, bytes, ranged, "download served"),
            Event::FileExpired {
                file_id,
                user_id,
                size,
            } => info!(%file_id, user_id, size, "file expired"),
            Event::FileMigrated { file_id, from, to } => {
                info!(%file_id, from, to, "file migrated")
            }
            Event::MigrationFailed { file_id, error } => {
                warn!(%file_id, %error, "file migration failed")
            }
            Event::SessionSwept { session_id } => info!(%session_id, "stale session swept"),
            Event::RateLimitRejected {
                limit_type,
                identifier,
            } => warn!(limit_type, %identifier, "rate limit rejected"),
            Event::AbuseBlocked { ip } => warn!(%ip, "ip blocked for abuse"),
        }
    }
}

/// Sink that retains events in memory; used by tests to assert emissions.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}
