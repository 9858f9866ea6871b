//! File metadata records and repository.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::datetime::now_millis;
use crate::storage::StorageTier;
use crate::{Result, StrataError};

/// Tier-migration bookkeeping on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    None,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::None => "none",
            MigrationStatus::Pending => "pending",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(MigrationStatus::None),
            "pending" => Ok(MigrationStatus::Pending),
            "in_progress" => Ok(MigrationStatus::InProgress),
            "completed" => Ok(MigrationStatus::Completed),
            "failed" => Ok(MigrationStatus::Failed),
            _ => Err(format!("unknown migration status: {s}")),
        }
    }
}

impl TryFrom<String> for MigrationStatus {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// A stored file.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub user_id: i64,
    pub folder_id: Option<i64>,
    /// Opaque key identifying the blob within its tier.
    pub storage_key: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    /// Lowercase hex SHA-256 of the content.
    pub hash: String,
    #[sqlx(try_from = "String")]
    pub storage_tier: StorageTier,
    pub downloads: i64,
    pub last_download_at: Option<i64>,
    pub last_access_at: i64,
    /// None = never expires (premium).
    pub expires_at: Option<i64>,
    pub is_public: bool,
    pub password: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<i64>,
    #[sqlx(try_from = "String")]
    pub migration_status: MigrationStatus,
    pub last_migration_at: Option<i64>,
    /// Free-form string map, JSON-encoded.
    pub metadata: String,
    pub created_at: i64,
}

impl FileRecord {
    /// Derived: a past expiry marks the file for sweeping.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    pub fn metadata_map(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

/// Data for inserting a file after a completed upload.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub user_id: i64,
    pub folder_id: Option<i64>,
    pub storage_key: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub hash: String,
    pub storage_tier: StorageTier,
    pub expires_at: Option<i64>,
    pub metadata: HashMap<String, String>,
}

/// Sort orders for file listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileSort {
    #[default]
    Date,
    Name,
    Size,
}

impl FileSort {
    fn order_clause(&self) -> &'static str {
        match self {
            FileSort::Date => "created_at DESC",
            FileSort::Name => "original_name ASC",
            FileSort::Size => "size DESC",
        }
    }
}

impl FromStr for FileSort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "date" => Ok(FileSort::Date),
            "name" => Ok(FileSort::Name),
            "size" => Ok(FileSort::Size),
            _ => Err(format!("unknown sort: {s}")),
        }
    }
}

/// Repository for file metadata.
pub struct FileRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FileRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, file: &NewFile) -> Result<FileRecord> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let metadata = serde_json::to_string(&file.metadata)
            .map_err(|e| StrataError::Internal(format!("metadata encoding: {e}")))?;

        sqlx::query(
            "INSERT INTO files (
                id, user_id, folder_id, storage_key, original_name, mime_type,
                size, hash, storage_tier, last_access_at, expires_at, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(file.user_id)
        .bind(file.folder_id)
        .bind(&file.storage_key)
        .bind(&file.original_name)
        .bind(&file.mime_type)
        .bind(file.size)
        .bind(&file.hash)
        .bind(file.storage_tier.as_str())
        .bind(now)
        .bind(file.expires_at)
        .bind(&metadata)
        .bind(now)
        .execute(self.pool)
        .await?;

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| StrataError::NotFound("file".into()))
    }

    /// Fetch regardless of deletion state.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        let file = sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(file)
    }

    /// Fetch only when not soft-deleted.
    pub async fn find_active(&self, id: &str) -> Result<Option<FileRecord>> {
        let file =
            sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE id = ? AND is_deleted = 0")
                .bind(id)
                .fetch_optional(self.pool)
                .await?;
        Ok(file)
    }

    /// Soft-delete. Returns false when already deleted or absent.
    pub async fn soft_delete(&self, id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE files SET is_deleted = 1, deleted_at = ? WHERE id = ? AND is_deleted = 0")
                .bind(now_millis())
                .bind(id)
                .execute(self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove the record entirely (recursive folder delete path).
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomic download bump: counter, last_download_at, last_access_at.
    ///
    /// The in-store increment keeps concurrent downloads from losing
    /// updates.
    pub async fn record_download(&self, id: &str) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            "UPDATE files
             SET downloads = downloads + 1, last_download_at = ?, last_access_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Extend a finite expiry to `max(current, candidate)`. Files with no
    /// expiry are left alone.
    pub async fn extend_expiry(&self, id: &str, candidate: i64) -> Result<()> {
        sqlx::query(
            "UPDATE files SET expires_at = MAX(expires_at, ?)
             WHERE id = ? AND expires_at IS NOT NULL",
        )
        .bind(candidate)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Files due for the expiry sweep, oldest deadline first.
    pub async fn expired_batch(&self, now: i64, limit: u32) -> Result<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files
             WHERE expires_at IS NOT NULL AND expires_at <= ? AND is_deleted = 0
             ORDER BY expires_at ASC
             LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(files)
    }

    /// Hot files stale enough to demote. Premium and admin owners are
    /// exempt, as are files already queued or moving.
    pub async fn cold_candidates(&self, cutoff: i64, limit: u32) -> Result<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(
            "SELECT f.* FROM files f
             JOIN users u ON u.id = f.user_id
             WHERE f.storage_tier = 'hot'
               AND f.is_deleted = 0
               AND f.last_access_at <= ?
               AND u.role = 'free'
               AND f.migration_status NOT IN ('pending', 'in_progress')
             ORDER BY f.last_access_at ASC
             LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(files)
    }

    /// Cold files popular enough to promote.
    pub async fn hot_candidates(
        &self,
        min_downloads: i64,
        downloaded_since: i64,
        limit: u32,
    ) -> Result<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files
             WHERE storage_tier = 'cold'
               AND is_deleted = 0
               AND downloads >= ?
               AND last_download_at IS NOT NULL AND last_download_at >= ?
               AND migration_status NOT IN ('pending', 'in_progress')
             ORDER BY downloads DESC
             LIMIT ?",
        )
        .bind(min_downloads)
        .bind(downloaded_since)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(files)
    }

    pub async fn set_migration_status(&self, id: &str, status: MigrationStatus) -> Result<()> {
        sqlx::query("UPDATE files SET migration_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Record a finished (or failed) migration.
    pub async fn finish_migration(
        &self,
        id: &str,
        tier: StorageTier,
        status: MigrationStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE files SET storage_tier = ?, migration_status = ?, last_migration_at = ? WHERE id = ?",
        )
        .bind(tier.as_str())
        .bind(status.as_str())
        .bind(now_millis())
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Aggregate usage over non-deleted files: (total bytes, file count).
    pub async fn usage_for_user(&self, user_id: i64) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(size), 0), COUNT(*)
             FROM files WHERE user_id = ? AND is_deleted = 0",
        )
        .bind(user_id)
        .fetch_one(self.pool)
        .await?;
        Ok(row)
    }

    /// Files directly inside a folder (or at the root when `folder_id` is
    /// None), paginated.
    pub async fn list_by_folder(
        &self,
        user_id: i64,
        folder_id: Option<i64>,
        page: u32,
        limit: u32,
        sort: FileSort,
    ) -> Result<Vec<FileRecord>> {
        let offset = page.saturating_sub(1) * limit;
        let sql = format!(
            "SELECT * FROM files
             WHERE user_id = ? AND is_deleted = 0
               AND {}
             ORDER BY {}
             LIMIT ? OFFSET ?",
            match folder_id {
                Some(_) => "folder_id = ?",
                None => "folder_id IS NULL AND ? IS NULL",
            },
            sort.order_clause()
        );

        let files = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(user_id)
            .bind(folder_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool)
            .await?;
        Ok(files)
    }

    /// All non-deleted files directly inside a folder, for recursive delete.
    pub async fn all_in_folder(&self, user_id: i64, folder_id: i64) -> Result<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files WHERE user_id = ? AND folder_id = ?",
        )
        .bind(user_id)
        .bind(folder_id)
        .fetch_all(self.pool)
        .await?;
        Ok(files)
    }

    /// Move a file into another folder (or the root).
    pub async fn set_folder(&self, id: &str, folder_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE files SET folder_id = ? WHERE id = ?")
            .bind(folder_id)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}
