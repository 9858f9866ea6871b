//! The download engine.
//!
//! Resolves metadata through the volatile cache, applies the access
//! policy, computes ranges, opens the byte stream, and schedules the
//! fire-and-forget side effects (counters, TTL extension, bandwidth).

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::warn;

use crate::access::AccessPolicy;
use crate::config::DownloadConfig;
use crate::datetime::{days_ms, now_millis};
use crate::events::{Event, EventSink};
use crate::file::{FileRecord, FileRepository};
use crate::quota::QuotaAccountant;
use crate::storage::{RangeStream, StorageBackend};
use crate::volatile::{keys, VolatileStore};
use crate::{Result, StrataError};

use super::range::parse_range_header;

/// Caller context for a download.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub user_id: Option<i64>,
    pub range_header: Option<String>,
    pub password: Option<String>,
}

/// HTTP-style response headers for a download.
#[derive(Debug, Clone)]
pub struct ResponseHeaders {
    pub content_type: String,
    pub content_disposition: String,
    pub accept_ranges: String,
    pub cache_control: String,
    pub etag: String,
    pub content_length: u64,
    pub content_range: Option<String>,
}

impl ResponseHeaders {
    /// Header pairs ready for the surface layer to write.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("Content-Type", self.content_type.clone()),
            ("Content-Disposition", self.content_disposition.clone()),
            ("Accept-Ranges", self.accept_ranges.clone()),
            ("Cache-Control", self.cache_control.clone()),
            ("ETag", self.etag.clone()),
            ("Content-Length", self.content_length.to_string()),
        ];
        if let Some(range) = &self.content_range {
            pairs.push(("Content-Range", range.clone()));
        }
        pairs
    }
}

/// A prepared download: stream, status, headers, resolved metadata.
#[derive(Debug)]
pub struct Download {
    pub stream: RangeStream,
    pub status: u16,
    pub headers: ResponseHeaders,
    pub metadata: FileRecord,
}

/// Percent-encode for a `filename=` parameter; unreserved characters pass
/// through untouched.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn file_key(file_id: &str) -> String {
    format!("{}{file_id}", keys::FILE_META)
}

/// The range-aware download engine.
pub struct DownloadEngine {
    pool: SqlitePool,
    backend: Arc<StorageBackend>,
    volatile: Arc<VolatileStore>,
    policy: AccessPolicy,
    quota: QuotaAccountant,
    events: Arc<dyn EventSink>,
    cache_ttl_secs: u64,
    extension_days: i64,
}

impl DownloadEngine {
    pub fn new(
        pool: SqlitePool,
        backend: Arc<StorageBackend>,
        volatile: Arc<VolatileStore>,
        quota: QuotaAccountant,
        events: Arc<dyn EventSink>,
        config: &DownloadConfig,
    ) -> Self {
        let policy = AccessPolicy::new(pool.clone());
        Self {
            pool,
            backend,
            volatile,
            policy,
            quota,
            events,
            cache_ttl_secs: config.metadata_cache_ttl_secs,
            extension_days: config.extension_days,
        }
    }

    /// Resolve file metadata: cache, then durable store. Deleted and
    /// expired files read as absent. A volatile outage is just a miss.
    pub async fn get_file_metadata(&self, file_id: &str) -> Result<FileRecord> {
        let now = now_millis();
        let key = file_key(file_id);

        if let Ok(Some(raw)) = self.volatile.get(&key) {
            if let Ok(file) = serde_json::from_str::<FileRecord>(&raw) {
                if file.is_deleted || file.is_expired(now) {
                    return Err(StrataError::NotFound("file".into()));
                }
                return Ok(file);
            }
        }

        let file = FileRepository::new(&self.pool)
            .find_active(file_id)
            .await?
            .ok_or_else(|| StrataError::NotFound("file".into()))?;
        if file.is_expired(now) {
            return Err(StrataError::NotFound("file".into()));
        }

        if let Ok(payload) = serde_json::to_string(&file) {
            if let Err(e) = self.volatile.set_ex(&key, payload, self.cache_ttl_secs) {
                warn!(%file_id, error = %e, "metadata cache write skipped");
            }
        }
        Ok(file)
    }

    /// Prepare a download: metadata, access, range, stream, headers, and
    /// the asynchronous side effects.
    pub async fn prepare_download(
        &self,
        file_id: &str,
        request: &DownloadRequest,
    ) -> Result<Download> {
        let file = self.get_file_metadata(file_id).await?;

        self.policy
            .check(&file, request.user_id, request.password.as_deref())
            .await?;

        let range = match &request.range_header {
            Some(header) => Some(parse_range_header(header, file.size as u64)?),
            None => None,
        };

        let stream = self
            .backend
            .open_range(
                &file.storage_key,
                file.storage_tier,
                range.map(|r| r.start),
                range.map(|r| r.end),
            )
            .await?;

        let (status, content_range) = match range {
            Some(r) => (
                206,
                Some(format!("bytes {}-{}/{}", r.start, r.end, file.size)),
            ),
            None => (200, None),
        };

        let headers = ResponseHeaders {
            content_type: file.mime_type.clone(),
            content_disposition: format!(
                "attachment; filename=\"{}\"",
                percent_encode(&file.original_name)
            ),
            accept_ranges: "bytes".to_string(),
            cache_control: "private, max-age=3600".to_string(),
            etag: format!("\"{}-{}\"", file.id, file.size),
            content_length: stream.len(),
            content_range,
        };

        self.events.emit(&Event::DownloadServed {
            file_id: file.id.clone(),
            user_id: request.user_id,
            bytes: stream.len(),
            ranged: range.is_some(),
        });

        // Full downloads bump the counter and push the expiry out; range
        // requests are partial reads and leave both alone.
        if range.is_none() {
            self.spawn_download_bookkeeping(file.id.clone());
        }
        if let Some(user_id) = request.user_id {
            self.spawn_bandwidth_accounting(user_id, stream.len() as i64);
        }

        Ok(Download {
            stream,
            status,
            headers,
            metadata: file,
        })
    }

    /// Counter increment, TTL extension, and cache invalidation, detached
    /// from the response path. Failures are logged, never surfaced.
    fn spawn_download_bookkeeping(&self, file_id: String) {
        let pool = self.pool.clone();
        let volatile = Arc::clone(&self.volatile);
        let extension_ms = days_ms(self.extension_days);

        tokio::spawn(async move {
            let files = FileRepository::new(&pool);
            if let Err(e) = files.record_download(&file_id).await {
                warn!(%file_id, error = %e, "download counter update failed");
                return;
            }
            if let Err(e) = files.extend_expiry(&file_id, now_millis() + extension_ms).await {
                warn!(%file_id, error = %e, "expiry extension failed");
            }
            if let Err(e) = volatile.delete(&file_key(&file_id)) {
                warn!(%file_id, error = %e, "metadata cache invalidation failed");
            }
        });
    }

    fn spawn_bandwidth_accounting(&self, user_id: i64, bytes: i64) {
        let quota = self.quota.clone();
        tokio::spawn(async move {
            if let Err(e) = quota.add_bandwidth(user_id, bytes).await {
                warn!(user_id, error = %e, "bandwidth accounting failed");
            }
        });
    }
}
