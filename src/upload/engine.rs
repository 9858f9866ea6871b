//! The chunked upload engine.
//!
//! Coordinates session init, chunk ingest, and assembly across the durable
//! store (source of record), the volatile store (in-flight arbiter), and
//! the storage backend (bytes). See [`SessionStatus`] for the lifecycle.

use std::sync::Arc;

use md5::{Digest, Md5};
use rand::Rng;
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

use crate::access::constant_time_eq;
use crate::config::UploadConfig;
use crate::datetime::{days_ms, now_millis};
use crate::events::{Event, EventSink};
use crate::file::{FileRecord, FileRepository, NewFile};
use crate::quota::{DenialReason, QuotaAccountant};
use crate::sanitize::{file_extension, sanitize_filename};
use crate::storage::{StorageBackend, StorageTier};
use crate::user::UserRepository;
use crate::volatile::{keys, VolatileError, VolatileResult, VolatileStore};
use crate::{Result, StrataError};

use super::session::{
    CachedSession, ChunkEntry, NewSession, SessionRepository, SessionStatus, UploadSession,
};

/// Request to start an upload.
#[derive(Debug, Clone)]
pub struct InitRequest {
    pub filename: String,
    pub total_size: i64,
    pub mime_type: Option<String>,
    pub expected_hash: Option<String>,
    pub folder_id: Option<i64>,
}

/// Synthesized client guide for driving the chunk protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadGuide {
    /// Template with `{index}` standing in for the chunk index.
    pub chunk_url_template: String,
    pub status_url: String,
    pub complete_url: String,
}

impl UploadGuide {
    fn for_session(session_id: &str) -> Self {
        Self {
            chunk_url_template: format!("/api/uploads/{session_id}/chunks/{{index}}"),
            status_url: format!("/api/uploads/{session_id}/status"),
            complete_url: format!("/api/uploads/{session_id}/complete"),
        }
    }
}

/// Successful init result.
#[derive(Debug, Clone)]
pub struct InitResponse {
    pub session_id: String,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub expires_at: i64,
    pub upload_urls: UploadGuide,
}

/// How a chunk post was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Accepted,
    /// The index was already recorded; the bytes were not re-ingested.
    AlreadyUploaded,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Accepted => "accepted",
            ChunkStatus::AlreadyUploaded => "already_uploaded",
        }
    }
}

/// Chunk post result with current progress.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub status: ChunkStatus,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub progress: f64,
}

/// Merged durable + volatile view of a session.
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub remaining_chunks: Vec<u32>,
    pub progress: f64,
    pub expires_at: i64,
}

/// `resume` payload: progress plus the URL guide.
#[derive(Debug, Clone)]
pub struct ResumeInfo {
    pub progress: SessionProgress,
    pub upload_urls: UploadGuide,
}

/// Map volatile-store failures onto the service taxonomy: an outage on a
/// session path is surfaced, never papered over.
fn vol<T>(result: VolatileResult<T>) -> Result<T> {
    result.map_err(|e| match e {
        VolatileError::Unavailable => {
            StrataError::Unavailable("volatile store unreachable".into())
        }
        other => StrataError::Internal(other.to_string()),
    })
}

fn session_key(session_id: &str) -> String {
    format!("{}{session_id}", keys::UPLOAD_SESSION)
}

fn chunks_key(session_id: &str) -> String {
    format!("{}{session_id}", keys::UPLOAD_CHUNKS)
}

fn resolve_mime(explicit: Option<&str>, filename: &str) -> String {
    if let Some(mime) = explicit {
        if !mime.trim().is_empty() {
            return mime.trim().to_string();
        }
    }
    let ext = file_extension(filename).to_lowercase();
    match ext.as_str() {
        ".txt" | ".log" => "text/plain",
        ".html" | ".htm" => "text/html",
        ".css" => "text/css",
        ".csv" => "text/csv",
        ".md" => "text/markdown",
        ".js" => "text/javascript",
        ".json" => "application/json",
        ".xml" => "application/xml",
        ".pdf" => "application/pdf",
        ".zip" => "application/zip",
        ".gz" => "application/gzip",
        ".tar" => "application/x-tar",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".svg" => "image/svg+xml",
        ".mp3" => "audio/mpeg",
        ".mp4" => "video/mp4",
        ".mov" => "video/quicktime",
        ".webm" => "video/webm",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Build the opaque storage key: `<userId>_<unixMillis>_<rand6><ext>`.
fn generate_storage_key(user_id: i64, original_name: &str) -> String {
    format!(
        "{user_id}_{}_{}{}",
        now_millis(),
        random_base36(6),
        file_extension(original_name)
    )
}

/// Tier for newly assembled files.
///
/// The user id is part of the signature for per-user tier policy; today
/// every new file lands hot and cold placement is worker-driven.
fn initial_tier(_user_id: i64) -> StorageTier {
    StorageTier::Hot
}

/// The chunked upload engine.
pub struct UploadEngine {
    pool: SqlitePool,
    backend: Arc<StorageBackend>,
    volatile: Arc<VolatileStore>,
    quota: QuotaAccountant,
    events: Arc<dyn EventSink>,
    chunk_size: i64,
    session_ttl_secs: u64,
    expiry_days_free: i64,
}

impl UploadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        backend: Arc<StorageBackend>,
        volatile: Arc<VolatileStore>,
        quota: QuotaAccountant,
        events: Arc<dyn EventSink>,
        config: &UploadConfig,
        expiry_days_free: i64,
    ) -> Self {
        Self {
            pool,
            backend,
            volatile,
            quota,
            events,
            chunk_size: config.chunk_size as i64,
            session_ttl_secs: config.session_ttl_secs,
            expiry_days_free,
        }
    }

    /// Start an upload session.
    pub async fn init(&self, user_id: i64, request: &InitRequest) -> Result<InitResponse> {
        let profile = UserRepository::new(&self.pool).profile(user_id).await?;
        let filename = sanitize_filename(&request.filename)?;

        if request.total_size <= 0 {
            return Err(StrataError::Validation(
                "upload size must be positive".into(),
            ));
        }

        let check = self.quota.can_upload(&profile, request.total_size).await?;
        if !check.allowed {
            if let Some(denial) = check
                .reasons
                .iter()
                .find(|d| d.reason == DenialReason::FileTooLarge)
            {
                return Err(StrataError::FileSizeLimit {
                    message: format!(
                        "file of {} bytes exceeds the {}-byte limit",
                        request.total_size, denial.limit
                    ),
                    limit: denial.limit,
                    actual: request.total_size,
                });
            }
            let codes: Vec<&str> = check.reasons.iter().map(|d| d.reason.as_str()).collect();
            return Err(StrataError::Validation(format!(
                "quota exceeded: {}",
                codes.join(", ")
            )));
        }

        if let Some(folder_id) = request.folder_id {
            let owned: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM folders WHERE id = ? AND user_id = ?)",
            )
            .bind(folder_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            if !owned {
                return Err(StrataError::NotFound("folder".into()));
            }
        }

        let mime_type = resolve_mime(request.mime_type.as_deref(), &filename);
        let total_chunks = (request.total_size + self.chunk_size - 1) / self.chunk_size;
        let session_id = Uuid::new_v4().to_string();
        let expires_at = now_millis() + self.session_ttl_secs as i64 * 1000;

        let session = SessionRepository::new(&self.pool)
            .insert(&NewSession {
                session_id: session_id.clone(),
                user_id,
                filename,
                mime_type,
                total_size: request.total_size,
                expected_hash: request
                    .expected_hash
                    .as_deref()
                    .filter(|h| !h.is_empty())
                    .map(|h| h.to_lowercase()),
                folder_id: request.folder_id,
                chunk_size: self.chunk_size,
                total_chunks,
                expires_at,
            })
            .await?;

        self.cache_session(&session)?;

        self.events.emit(&Event::UploadSessionStarted {
            session_id: session_id.clone(),
            user_id,
            total_chunks: total_chunks as u32,
        });

        Ok(InitResponse {
            session_id: session_id.clone(),
            chunk_size: self.chunk_size,
            total_chunks,
            expires_at,
            upload_urls: UploadGuide::for_session(&session_id),
        })
    }

    fn cache_session(&self, session: &UploadSession) -> Result<()> {
        let cached = CachedSession::from(session);
        let payload = serde_json::to_string(&cached)
            .map_err(|e| StrataError::Internal(format!("session cache encoding: {e}")))?;
        let remaining = ((session.expires_at - now_millis()) / 1000).max(1) as u64;
        vol(self
            .volatile
            .set_ex(&session_key(&session.session_id), payload, remaining))
    }

    /// Resolve a live session: cache first, durable on miss (rehydrating
    /// the cache). Absent, expired, and terminal sessions all read as gone.
    async fn resolve_live(&self, session_id: &str) -> Result<CachedSession> {
        let now = now_millis();

        if let Some(raw) = vol(self.volatile.get(&session_key(session_id)))? {
            if let Ok(cached) = serde_json::from_str::<CachedSession>(&raw) {
                if cached.expires_at <= now {
                    return Err(StrataError::SessionExpired(session_id.to_string()));
                }
                let status: SessionStatus = cached.status.parse().unwrap_or_default();
                if status.is_terminal() {
                    return Err(StrataError::SessionExpired(session_id.to_string()));
                }
                return Ok(cached);
            }
        }

        let session = SessionRepository::new(&self.pool)
            .find(session_id)
            .await?
            .ok_or_else(|| StrataError::SessionExpired(session_id.to_string()))?;
        if session.is_expired(now) || session.status.is_terminal() {
            return Err(StrataError::SessionExpired(session_id.to_string()));
        }
        self.cache_session(&session)?;
        Ok(CachedSession::from(&session))
    }

    /// Ingest one chunk. Duplicate indices are acknowledged without
    /// re-ingesting; the volatile chunk set is the arbiter.
    pub async fn chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        bytes: &[u8],
        provided_hash: Option<&str>,
    ) -> Result<ChunkOutcome> {
        let cached = self.resolve_live(session_id).await?;
        let total_chunks = cached.total_chunks as u32;

        if chunk_index as i64 >= cached.total_chunks {
            return Err(StrataError::ChunkValidation {
                message: format!(
                    "chunk index {chunk_index} out of range (0..{})",
                    cached.total_chunks
                ),
                chunk_index: Some(chunk_index),
            });
        }

        let chunks_key = chunks_key(session_id);
        if vol(self.volatile.sismember(&chunks_key, &chunk_index.to_string()))? {
            let completed = vol(self.volatile.scard(&chunks_key))? as u32;
            return Ok(ChunkOutcome {
                status: ChunkStatus::AlreadyUploaded,
                completed_chunks: completed,
                total_chunks,
                progress: completed as f64 / total_chunks as f64,
            });
        }

        let expected = expected_chunk_size(
            cached.total_size as u64,
            cached.chunk_size as u64,
            chunk_index,
            total_chunks,
        );
        if bytes.len() as u64 != expected {
            return Err(StrataError::ChunkValidation {
                message: format!(
                    "chunk {chunk_index} is {} bytes, expected {expected}",
                    bytes.len()
                ),
                chunk_index: Some(chunk_index),
            });
        }

        let hash = md5_hex(bytes);
        if let Some(provided) = provided_hash.filter(|h| !h.is_empty()) {
            if !constant_time_eq(provided.to_lowercase().as_bytes(), hash.as_bytes()) {
                return Err(StrataError::ChunkValidation {
                    message: format!("chunk {chunk_index} hash mismatch"),
                    chunk_index: Some(chunk_index),
                });
            }
        }

        self.backend.write_chunk(session_id, chunk_index, bytes).await?;

        let remaining_ttl = ((cached.expires_at - now_millis()) / 1000).max(1) as u64;
        vol(self.volatile.sadd(&chunks_key, chunk_index.to_string()))?;
        vol(self.volatile.expire(&chunks_key, remaining_ttl))?;

        SessionRepository::new(&self.pool)
            .append_chunk(
                session_id,
                &ChunkEntry {
                    index: chunk_index,
                    size: bytes.len() as u64,
                    hash,
                    completed_at: now_millis(),
                },
            )
            .await?;

        let completed = vol(self.volatile.scard(&chunks_key))? as u32;
        Ok(ChunkOutcome {
            status: ChunkStatus::Accepted,
            completed_chunks: completed,
            total_chunks,
            progress: completed as f64 / total_chunks as f64,
        })
    }

    /// Merged progress view. The volatile chunk set wins for in-flight
    /// state; when the volatile store is down this degrades to the durable
    /// journal alone.
    pub async fn status(&self, session_id: &str) -> Result<SessionProgress> {
        let session = SessionRepository::new(&self.pool)
            .find(session_id)
            .await?
            .ok_or_else(|| StrataError::SessionExpired(session_id.to_string()))?;
        Ok(self.progress_of(&session))
    }

    fn progress_of(&self, session: &UploadSession) -> SessionProgress {
        let mut completed: Vec<u32> = session.chunk_entries().iter().map(|e| e.index).collect();
        match self.volatile.smembers(&chunks_key(&session.session_id)) {
            Ok(members) => {
                completed.extend(members.iter().filter_map(|m| m.parse::<u32>().ok()));
            }
            Err(e) => warn!(session_id = %session.session_id, error = %e, "volatile unavailable, durable journal only"),
        }
        completed.sort_unstable();
        completed.dedup();

        let total = session.total_chunks as u32;
        let remaining: Vec<u32> = (0..total)
            .filter(|i| completed.binary_search(i).is_err())
            .collect();

        SessionProgress {
            session_id: session.session_id.clone(),
            status: session.status,
            total_chunks: total,
            completed_chunks: completed.len() as u32,
            remaining_chunks: remaining,
            progress: if total == 0 {
                0.0
            } else {
                completed.len() as f64 / total as f64
            },
            expires_at: session.expires_at,
        }
    }

    /// Assemble a fully uploaded session into a stored file.
    pub async fn complete(&self, session_id: &str, user_id: i64) -> Result<FileRecord> {
        let sessions = SessionRepository::new(&self.pool);
        let session = sessions
            .find(session_id)
            .await?
            .ok_or_else(|| StrataError::SessionExpired(session_id.to_string()))?;

        if session.user_id != user_id {
            return Err(StrataError::Authorization(
                "session belongs to another user".into(),
            ));
        }
        match session.status {
            SessionStatus::Pending | SessionStatus::Uploading => {}
            SessionStatus::Assembling => {
                return Err(StrataError::Conflict("assembly already in progress".into()));
            }
            SessionStatus::Completed => {
                return Err(StrataError::Conflict("session already completed".into()));
            }
            SessionStatus::Failed | SessionStatus::Expired => {
                return Err(StrataError::SessionExpired(session_id.to_string()));
            }
        }
        if session.is_expired(now_millis()) {
            return Err(StrataError::SessionExpired(session_id.to_string()));
        }

        let progress = self.progress_of(&session);
        if progress.completed_chunks as i64 != session.total_chunks {
            return Err(StrataError::UploadIncomplete {
                missing: progress.remaining_chunks.len(),
            });
        }

        sessions
            .set_status(session_id, SessionStatus::Assembling, None)
            .await?;

        let profile = UserRepository::new(&self.pool).profile(user_id).await?;
        let storage_key = generate_storage_key(user_id, &session.filename);
        let tier = initial_tier(user_id);

        let assembled = match self
            .backend
            .assemble_chunks(session_id, &storage_key, session.total_chunks as u32, tier)
            .await
        {
            Ok(assembled) => assembled,
            Err(e) => {
                sessions
                    .set_status(session_id, SessionStatus::Failed, Some(e.code()))
                    .await?;
                self.evict_session(session_id);
                self.events.emit(&Event::UploadFailed {
                    session_id: session_id.to_string(),
                    code: "STORAGE_ERROR",
                });
                return Err(e);
            }
        };

        if let Some(expected) = session.expected_hash.as_deref() {
            if !constant_time_eq(expected.as_bytes(), assembled.hash.as_bytes()) {
                self.backend.delete(&storage_key, tier).await?;
                self.backend.delete_chunks(session_id).await?;
                sessions
                    .set_status(session_id, SessionStatus::Failed, Some("HASH_MISMATCH"))
                    .await?;
                self.evict_session(session_id);
                self.events.emit(&Event::UploadFailed {
                    session_id: session_id.to_string(),
                    code: "HASH_MISMATCH",
                });
                return Err(StrataError::HashMismatch {
                    expected: expected.to_string(),
                    actual: assembled.hash,
                });
            }
        }

        let expires_at = if profile.role.is_unlimited() {
            None
        } else {
            Some(now_millis() + days_ms(self.expiry_days_free))
        };

        let file = FileRepository::new(&self.pool)
            .insert(&NewFile {
                user_id,
                folder_id: session.folder_id,
                storage_key,
                original_name: session.filename.clone(),
                mime_type: session.mime_type.clone(),
                size: assembled.size as i64,
                hash: assembled.hash,
                storage_tier: tier,
                expires_at,
                metadata: Default::default(),
            })
            .await?;

        self.quota.add_file(&profile, file.size).await?;
        sessions
            .mark_completed(session_id, &file.id, tier.as_str())
            .await?;
        self.backend.delete_chunks(session_id).await?;
        self.evict_session(session_id);

        self.events.emit(&Event::UploadCompleted {
            session_id: session_id.to_string(),
            file_id: file.id.clone(),
            user_id,
            size: file.size,
        });

        Ok(file)
    }

    /// Abort a session, discarding staged chunks. Idempotent: an unknown
    /// session is a success.
    pub async fn abort(&self, session_id: &str, user_id: i64) -> Result<()> {
        let sessions = SessionRepository::new(&self.pool);
        let session = match sessions.find(session_id).await? {
            Some(s) => s,
            None => return Ok(()),
        };
        if session.user_id != user_id {
            return Err(StrataError::Authorization(
                "session belongs to another user".into(),
            ));
        }

        self.backend.delete_chunks(session_id).await?;
        if !session.status.is_terminal() {
            sessions
                .set_status(session_id, SessionStatus::Failed, Some("ABORTED"))
                .await?;
        }
        self.evict_session(session_id);
        Ok(())
    }

    /// Like `status`, plus the URL guide so clients can pick up where they
    /// left off.
    pub async fn resume(&self, session_id: &str, user_id: i64) -> Result<ResumeInfo> {
        let session = SessionRepository::new(&self.pool)
            .find(session_id)
            .await?
            .ok_or_else(|| StrataError::SessionExpired(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(StrataError::Authorization(
                "session belongs to another user".into(),
            ));
        }
        Ok(ResumeInfo {
            progress: self.progress_of(&session),
            upload_urls: UploadGuide::for_session(session_id),
        })
    }

    /// Best-effort cache eviction; an outage here only delays expiry.
    fn evict_session(&self, session_id: &str) {
        if let Err(e) = self.volatile.delete(&session_key(session_id)) {
            warn!(%session_id, error = %e, "failed to evict session cache");
        }
        if let Err(e) = self.volatile.delete(&chunks_key(session_id)) {
            warn!(%session_id, error = %e, "failed to evict chunk set");
        }
    }
}

fn expected_chunk_size(total_size: u64, chunk_size: u64, index: u32, total_chunks: u32) -> u64 {
    let remainder = total_size % chunk_size;
    if index == total_chunks - 1 && remainder != 0 {
        remainder
    } else {
        chunk_size
    }
}
