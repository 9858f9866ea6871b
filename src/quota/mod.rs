//! Per-user storage, file-count, and bandwidth accounting.
//!
//! Limits resolve per field: the user's override when set, otherwise the
//! admin-set value on the quota row, otherwise the role default. A value of
//! `-1` means unlimited. Free-tier defaults come from configuration;
//! premium and admin accounts are unlimited across the board.
//!
//! `is_over_quota` is a soft flag: ingress is gated by `can_upload` at
//! session init, so a user can land over the line mid-flight; the flag
//! records that moment.

use sqlx::SqlitePool;

use crate::config::QuotaConfig;
use crate::datetime::{now_millis, same_day, same_month};
use crate::file::FileRepository;
use crate::user::{Role, UserProfile};
use crate::Result;

/// Unlimited sentinel for any limit field.
pub const UNLIMITED: i64 = -1;

/// Durable quota row, auto-created on first use.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QuotaRow {
    pub user_id: i64,
    pub max_storage: Option<i64>,
    pub max_file_size: Option<i64>,
    pub max_files: Option<i64>,
    pub used_storage: i64,
    pub used_files: i64,
    pub bandwidth_daily: i64,
    pub bandwidth_monthly: i64,
    pub bandwidth_last_reset: i64,
    pub is_over_quota: bool,
    pub over_quota_since: Option<i64>,
}

/// Fully resolved limits; `-1` = unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub max_storage: i64,
    pub max_file_size: i64,
    pub max_files: i64,
}

/// Why an upload was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    FileTooLarge,
    StorageExceeded,
    FileCountExceeded,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::FileTooLarge => "FILE_TOO_LARGE",
            DenialReason::StorageExceeded => "STORAGE_EXCEEDED",
            DenialReason::FileCountExceeded => "FILE_COUNT_EXCEEDED",
        }
    }
}

/// One refusal with its numbers.
#[derive(Debug, Clone)]
pub struct QuotaDenial {
    pub reason: DenialReason,
    pub limit: i64,
    pub current: i64,
    pub required: Option<i64>,
}

/// Outcome of a pre-upload quota check.
#[derive(Debug, Clone)]
pub struct UploadCheck {
    pub allowed: bool,
    pub reasons: Vec<QuotaDenial>,
}

/// Usage summary for display.
#[derive(Debug, Clone)]
pub struct QuotaSummary {
    pub limits: EffectiveLimits,
    pub used_storage: i64,
    pub used_files: i64,
    pub bandwidth_daily: i64,
    pub bandwidth_monthly: i64,
    /// Storage use as a fraction of the limit; None when unlimited.
    pub storage_percent: Option<f64>,
    pub is_over_quota: bool,
}

/// Quota accounting service.
#[derive(Debug, Clone)]
pub struct QuotaAccountant {
    pool: SqlitePool,
    config: QuotaConfig,
}

impl QuotaAccountant {
    pub fn new(pool: SqlitePool, config: QuotaConfig) -> Self {
        Self { pool, config }
    }

    fn role_default(&self, role: Role) -> EffectiveLimits {
        match role {
            Role::Free => EffectiveLimits {
                max_storage: self.config.free_max_storage,
                max_file_size: self.config.free_max_file_size,
                max_files: self.config.free_max_files,
            },
            Role::Premium | Role::Admin => EffectiveLimits {
                max_storage: UNLIMITED,
                max_file_size: UNLIMITED,
                max_files: UNLIMITED,
            },
        }
    }

    /// Resolve one field: user override, quota-row limit, role default.
    fn resolve(&self, profile: &UserProfile, row: &QuotaRow) -> EffectiveLimits {
        let defaults = self.role_default(profile.role);
        EffectiveLimits {
            max_storage: profile
                .quota_max_storage
                .or(row.max_storage)
                .unwrap_or(defaults.max_storage),
            max_file_size: profile
                .quota_max_file_size
                .or(row.max_file_size)
                .unwrap_or(defaults.max_file_size),
            max_files: row.max_files.unwrap_or(defaults.max_files),
        }
    }

    async fn ensure_row(&self, user_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO quotas (user_id, bandwidth_last_reset) VALUES (?, ?)",
        )
        .bind(user_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The quota row, created on first access.
    pub async fn row(&self, user_id: i64) -> Result<QuotaRow> {
        self.ensure_row(user_id).await?;
        let row = sqlx::query_as::<_, QuotaRow>("SELECT * FROM quotas WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    /// Would a file of `file_size` bytes fit? Collects every violated limit.
    pub async fn can_upload(&self, profile: &UserProfile, file_size: i64) -> Result<UploadCheck> {
        let row = self.row(profile.id).await?;
        let limits = self.resolve(profile, &row);
        let mut reasons = Vec::new();

        if limits.max_file_size != UNLIMITED && file_size > limits.max_file_size {
            reasons.push(QuotaDenial {
                reason: DenialReason::FileTooLarge,
                limit: limits.max_file_size,
                current: file_size,
                required: None,
            });
        }
        if limits.max_storage != UNLIMITED && row.used_storage + file_size > limits.max_storage {
            reasons.push(QuotaDenial {
                reason: DenialReason::StorageExceeded,
                limit: limits.max_storage,
                current: row.used_storage,
                required: Some(file_size),
            });
        }
        if limits.max_files != UNLIMITED && row.used_files + 1 > limits.max_files {
            reasons.push(QuotaDenial {
                reason: DenialReason::FileCountExceeded,
                limit: limits.max_files,
                current: row.used_files,
                required: Some(1),
            });
        }

        Ok(UploadCheck {
            allowed: reasons.is_empty(),
            reasons,
        })
    }

    /// Account a newly stored file.
    pub async fn add_file(&self, profile: &UserProfile, size: i64) -> Result<()> {
        self.ensure_row(profile.id).await?;
        sqlx::query(
            "UPDATE quotas SET used_storage = used_storage + ?, used_files = used_files + 1
             WHERE user_id = ?",
        )
        .bind(size)
        .bind(profile.id)
        .execute(&self.pool)
        .await?;
        self.refresh_over_quota(profile).await
    }

    /// Release a removed file. Counters floor at zero.
    pub async fn remove_file(&self, profile: &UserProfile, size: i64) -> Result<()> {
        self.ensure_row(profile.id).await?;
        sqlx::query(
            "UPDATE quotas
             SET used_storage = MAX(0, used_storage - ?),
                 used_files = MAX(0, used_files - 1)
             WHERE user_id = ?",
        )
        .bind(size)
        .bind(profile.id)
        .execute(&self.pool)
        .await?;
        self.refresh_over_quota(profile).await
    }

    async fn refresh_over_quota(&self, profile: &UserProfile) -> Result<()> {
        let row = self.row(profile.id).await?;
        let limits = self.resolve(profile, &row);
        let over = limits.max_storage != UNLIMITED && row.used_storage > limits.max_storage;

        if over && !row.is_over_quota {
            sqlx::query(
                "UPDATE quotas SET is_over_quota = 1, over_quota_since = ? WHERE user_id = ?",
            )
            .bind(now_millis())
            .bind(profile.id)
            .execute(&self.pool)
            .await?;
        } else if !over && row.is_over_quota {
            sqlx::query(
                "UPDATE quotas SET is_over_quota = 0, over_quota_since = NULL WHERE user_id = ?",
            )
            .bind(profile.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Add downloaded bytes to the bandwidth counters.
    ///
    /// The daily counter resets when the wall-clock day changes since the
    /// last update, the monthly counter when the month changes.
    pub async fn add_bandwidth(&self, user_id: i64, bytes: i64) -> Result<()> {
        let row = self.row(user_id).await?;
        let now = now_millis();

        let daily_base = if same_day(row.bandwidth_last_reset, now) {
            row.bandwidth_daily
        } else {
            0
        };
        let monthly_base = if same_month(row.bandwidth_last_reset, now) {
            row.bandwidth_monthly
        } else {
            0
        };

        sqlx::query(
            "UPDATE quotas
             SET bandwidth_daily = ?, bandwidth_monthly = ?, bandwidth_last_reset = ?
             WHERE user_id = ?",
        )
        .bind(daily_base + bytes)
        .bind(monthly_base + bytes)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_summary(&self, profile: &UserProfile) -> Result<QuotaSummary> {
        let row = self.row(profile.id).await?;
        let limits = self.resolve(profile, &row);
        let storage_percent = if limits.max_storage == UNLIMITED || limits.max_storage == 0 {
            None
        } else {
            Some(row.used_storage as f64 / limits.max_storage as f64)
        };
        Ok(QuotaSummary {
            limits,
            used_storage: row.used_storage,
            used_files: row.used_files,
            bandwidth_daily: row.bandwidth_daily,
            bandwidth_monthly: row.bandwidth_monthly,
            storage_percent,
            is_over_quota: row.is_over_quota,
        })
    }

    /// Recompute usage from the file records, correcting drift.
    pub async fn sync_from_files(&self, profile: &UserProfile) -> Result<()> {
        let (bytes, count) = FileRepository::new(&self.pool)
            .usage_for_user(profile.id)
            .await?;
        self.ensure_row(profile.id).await?;
        sqlx::query("UPDATE quotas SET used_storage = ?, used_files = ? WHERE user_id = ?")
            .bind(bytes)
            .bind(count)
            .bind(profile.id)
            .execute(&self.pool)
            .await?;
        self.refresh_over_quota(profile).await
    }
}
