//! Error types for strata.

use thiserror::Error;

/// Common error type for strata.
///
/// Every variant maps to a stable wire code via [`StrataError::code`] and an
/// HTTP status analog via [`StrataError::status_code`]. The core never builds
/// HTTP responses itself; the surface layer serializes these as
/// `{ error: { code, message, statusCode, ... } }`.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Input malformed or constraints violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// Credential absent, invalid, or expired.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Authenticated principal lacks access.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Resource absent or soft-deleted.
    #[error("{0} not found")]
    NotFound(String),

    /// Uniqueness violation (email, folder name).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Upload session absent or expired.
    #[error("upload session expired: {0}")]
    SessionExpired(String),

    /// File exceeds the applicable size limit.
    #[error("{message}")]
    FileSizeLimit {
        message: String,
        limit: i64,
        actual: i64,
    },

    /// Sliding window full.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Chunk index, size, or hash invalid.
    #[error("{message}")]
    ChunkValidation {
        message: String,
        chunk_index: Option<u32>,
    },

    /// Final assembled hash disagrees with the expected hash.
    #[error("assembled file hash mismatch (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },

    /// `complete` called with chunks still missing.
    #[error("upload incomplete: {missing} chunk(s) missing")]
    UploadIncomplete { missing: usize },

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error from the storage backend.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Abuse score reached the block threshold.
    #[error("IP blocked for abuse, retry after {retry_after_secs}s")]
    IpBlocked { retry_after_secs: u64 },

    /// Range header malformed or unsatisfiable.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Volatile store unreachable on a path that cannot degrade.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Metadata store error.
    #[error("database error: {0}")]
    Database(String),

    /// Unclassified internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StrataError::Validation(_) => "VALIDATION_ERROR",
            StrataError::Authentication(_) => "AUTHENTICATION_ERROR",
            StrataError::Authorization(_) => "AUTHORIZATION_ERROR",
            StrataError::NotFound(_) => "NOT_FOUND",
            StrataError::Conflict(_) => "CONFLICT",
            StrataError::SessionExpired(_) => "SESSION_EXPIRED",
            StrataError::FileSizeLimit { .. } => "FILE_SIZE_LIMIT",
            StrataError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            StrataError::ChunkValidation { .. } => "CHUNK_VALIDATION_ERROR",
            StrataError::HashMismatch { .. } => "HASH_MISMATCH",
            StrataError::UploadIncomplete { .. } => "UPLOAD_INCOMPLETE",
            StrataError::Storage(_) | StrataError::Io(_) => "STORAGE_ERROR",
            StrataError::IpBlocked { .. } => "IP_BLOCKED",
            StrataError::InvalidRange(_) => "INVALID_RANGE",
            StrataError::Unavailable(_) => "SERVICE_UNAVAILABLE",
            StrataError::Database(_) | StrataError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status analog for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StrataError::Validation(_)
            | StrataError::ChunkValidation { .. }
            | StrataError::HashMismatch { .. }
            | StrataError::UploadIncomplete { .. } => 400,
            StrataError::Authentication(_) => 401,
            StrataError::Authorization(_) | StrataError::IpBlocked { .. } => 403,
            StrataError::NotFound(_) => 404,
            StrataError::Conflict(_) => 409,
            StrataError::SessionExpired(_) => 410,
            StrataError::FileSizeLimit { .. } => 413,
            StrataError::InvalidRange(_) => 416,
            StrataError::RateLimitExceeded { .. } => 429,
            StrataError::Unavailable(_) => 503,
            StrataError::Storage(_)
            | StrataError::Io(_)
            | StrataError::Database(_)
            | StrataError::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for StrataError {
    fn from(e: sqlx::Error) -> Self {
        StrataError::Database(e.to_string())
    }
}

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;
