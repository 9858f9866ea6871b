//! Configuration module for strata.

use serde::Deserialize;
use std::path::Path;

use crate::{Result, StrataError};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Maximum pool connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_db_path() -> String {
    "data/strata.db".to_string()
}

fn default_pool_size() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

/// Object storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory under which both tiers and the chunk staging area live.
    #[serde(default = "default_storage_base")]
    pub base_path: String,
}

fn default_storage_base() -> String {
    "data/objects".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_storage_base(),
        }
    }
}

/// Chunked upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Size of every chunk except possibly the last, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Upload session lifetime in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

fn default_chunk_size() -> u64 {
    10 * 1024 * 1024
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

/// Download configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// TTL for the cached file metadata entry, in seconds.
    #[serde(default = "default_metadata_cache_ttl")]
    pub metadata_cache_ttl_secs: u64,
    /// Days added to a file's expiry when it is downloaded.
    #[serde(default = "default_extension_days")]
    pub extension_days: i64,
}

fn default_metadata_cache_ttl() -> u64 {
    300
}

fn default_extension_days() -> i64 {
    5
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            metadata_cache_ttl_secs: default_metadata_cache_ttl(),
            extension_days: default_extension_days(),
        }
    }
}

/// Lifecycle worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Worker tick interval in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Maximum items processed per tick per worker.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Days before a free-tier file expires.
    #[serde(default = "default_expiry_days_free")]
    pub expiry_days_free: i64,
    /// Days of inactivity before a hot file becomes a cold candidate.
    #[serde(default = "default_hot_to_cold_days")]
    pub hot_to_cold_days: i64,
    /// Download count at which a cold file becomes a hot candidate.
    #[serde(default = "default_cold_to_hot_downloads")]
    pub cold_to_hot_downloads: i64,
    /// Recency window for cold-to-hot promotion, in days.
    #[serde(default = "default_hot_window_days")]
    pub hot_window_days: i64,
    /// Age after which an orphaned chunk directory is collected, in seconds.
    #[serde(default = "default_orphan_age_secs")]
    pub orphan_age_secs: u64,
    /// Days a terminal session record is retained before purge.
    #[serde(default = "default_session_purge_days")]
    pub session_purge_days: i64,
}

fn default_tick_secs() -> u64 {
    60 * 60
}

fn default_batch_size() -> u32 {
    100
}

fn default_expiry_days_free() -> i64 {
    5
}

fn default_hot_to_cold_days() -> i64 {
    30
}

fn default_cold_to_hot_downloads() -> i64 {
    5
}

fn default_hot_window_days() -> i64 {
    7
}

fn default_orphan_age_secs() -> u64 {
    60 * 60
}

fn default_session_purge_days() -> i64 {
    7
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            expiry_days_free: default_expiry_days_free(),
            hot_to_cold_days: default_hot_to_cold_days(),
            cold_to_hot_downloads: default_cold_to_hot_downloads(),
            hot_window_days: default_hot_window_days(),
            orphan_age_secs: default_orphan_age_secs(),
            session_purge_days: default_session_purge_days(),
        }
    }
}

/// Per-role allowance for one rate-limited operation type.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitRule {
    /// Sliding window length in seconds.
    pub window_secs: u64,
    /// Allowance for free-tier principals.
    pub free: u32,
    /// Allowance for premium principals.
    pub premium: u32,
    /// Allowance for admins.
    pub admin: u32,
    /// Allowance for anonymous (IP-keyed) callers.
    pub anonymous: u32,
}

impl RateLimitRule {
    fn new(window_secs: u64, free: u32, premium: u32, admin: u32, anonymous: u32) -> Self {
        Self {
            window_secs,
            free,
            premium,
            admin,
            anonymous,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Upload operations.
    #[serde(default = "default_upload_rule")]
    pub upload: RateLimitRule,
    /// Download operations.
    #[serde(default = "default_download_rule")]
    pub download: RateLimitRule,
    /// Authentication attempts.
    #[serde(default = "default_auth_rule")]
    pub auth: RateLimitRule,
    /// Abuse score at which an IP is blocked.
    #[serde(default = "default_abuse_threshold")]
    pub abuse_threshold: i64,
    /// Window over which the abuse score accumulates, in seconds.
    #[serde(default = "default_abuse_window_secs")]
    pub abuse_window_secs: u64,
}

fn default_upload_rule() -> RateLimitRule {
    RateLimitRule::new(60, 20, 60, 120, 5)
}

fn default_download_rule() -> RateLimitRule {
    RateLimitRule::new(60, 60, 300, 600, 30)
}

fn default_auth_rule() -> RateLimitRule {
    RateLimitRule::new(900, 10, 10, 20, 10)
}

fn default_abuse_threshold() -> i64 {
    100
}

fn default_abuse_window_secs() -> u64 {
    60 * 60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            upload: default_upload_rule(),
            download: default_download_rule(),
            auth: default_auth_rule(),
            abuse_threshold: default_abuse_threshold(),
            abuse_window_secs: default_abuse_window_secs(),
        }
    }
}

/// Free-tier quota defaults. Premium and admin accounts are unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Maximum total stored bytes per free user.
    #[serde(default = "default_free_max_storage")]
    pub free_max_storage: i64,
    /// Maximum size of a single file for free users.
    #[serde(default = "default_free_max_file_size")]
    pub free_max_file_size: i64,
    /// Maximum live file count per free user.
    #[serde(default = "default_free_max_files")]
    pub free_max_files: i64,
}

fn default_free_max_storage() -> i64 {
    50 * 1024 * 1024 * 1024
}

fn default_free_max_file_size() -> i64 {
    10 * 1024 * 1024 * 1024
}

fn default_free_max_files() -> i64 {
    1000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_max_storage: default_free_max_storage(),
            free_max_file_size: default_free_max_file_size(),
            free_max_files: default_free_max_files(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace / debug / info / warn / error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file path; console-only when absent.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StrataError::Validation(format!("invalid config: {e}")))?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size == 0 {
            return Err(StrataError::Validation(
                "upload.chunk_size must be positive".into(),
            ));
        }
        if self.upload.session_ttl_secs == 0 {
            return Err(StrataError::Validation(
                "upload.session_ttl_secs must be positive".into(),
            ));
        }
        if self.lifecycle.batch_size == 0 {
            return Err(StrataError::Validation(
                "lifecycle.batch_size must be positive".into(),
            ));
        }
        if self.lifecycle.tick_secs == 0 {
            return Err(StrataError::Validation(
                "lifecycle.tick_secs must be positive".into(),
            ));
        }
        if self.storage.base_path.is_empty() {
            return Err(StrataError::Validation(
                "storage.base_path must not be empty".into(),
            ));
        }
        for (name, rule) in [
            ("upload", &self.rate_limit.upload),
            ("download", &self.rate_limit.download),
            ("auth", &self.rate_limit.auth),
        ] {
            if rule.window_secs == 0 {
                return Err(StrataError::Validation(format!(
                    "rate_limit.{name}.window_secs must be positive"
                )));
            }
        }
        Ok(())
    }
}
