//! strata — multi-tenant tiered file storage.
//!
//! Resumable chunked uploads, range-capable downloads, and background
//! lifecycle management over two on-disk tiers. The HTTP surface,
//! authentication token handling, and metrics exporters live outside this
//! crate; it consumes authenticated principals and emits events through
//! [`events::EventSink`].

pub mod access;
pub mod config;
pub mod datetime;
pub mod db;
pub mod download;
pub mod error;
pub mod events;
pub mod file;
pub mod folder;
pub mod logging;
pub mod quota;
pub mod ratelimit;
pub mod sanitize;
pub mod storage;
pub mod upload;
pub mod user;
pub mod volatile;
pub mod workers;

pub use access::AccessPolicy;
pub use config::Config;
pub use db::Database;
pub use download::{Download, DownloadEngine, DownloadRequest};
pub use error::{Result, StrataError};
pub use events::{Event, EventSink, LogEventSink};
pub use file::{FileRecord, FileRepository};
pub use folder::FolderTree;
pub use quota::QuotaAccountant;
pub use ratelimit::{Identifier, LimitType, RateLimiter};
pub use storage::{StorageBackend, StorageTier};
pub use upload::{UploadEngine, UploadSession};
pub use user::{Role, User, UserProfile, UserRepository};
pub use volatile::VolatileStore;
pub use workers::{CleanupWorker, ExpiryWorker, MigrationWorker};
