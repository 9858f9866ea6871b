//! Upload session records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::datetime::now_millis;
use crate::{Result, StrataError};

/// Upload session lifecycle.
///
/// ```text
/// pending -> uploading -> assembling -> completed
///     \          \            \-> failed
///      \          \-> failed | expired
///       \-> failed | expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Pending,
    Uploading,
    Assembling,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Assembling => "assembling",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }

    /// Completed, failed, and expired sessions never advance again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Expired
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "uploading" => Ok(SessionStatus::Uploading),
            "assembling" => Ok(SessionStatus::Assembling),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "expired" => Ok(SessionStatus::Expired),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// One completed chunk in the durable journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkEntry {
    pub index: u32,
    pub size: u64,
    /// Lowercase hex MD5 of the chunk bytes.
    pub hash: String,
    pub completed_at: i64,
}

/// Durable upload session record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UploadSession {
    pub session_id: String,
    pub user_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub total_size: i64,
    pub expected_hash: Option<String>,
    pub folder_id: Option<i64>,
    pub chunk_size: i64,
    pub total_chunks: i64,
    /// JSON journal of [`ChunkEntry`] values.
    pub completed_chunks: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub error: Option<String>,
    pub file_id: Option<String>,
    pub storage_tier: Option<String>,
    pub started_at: i64,
    pub last_activity_at: i64,
    pub completed_at: Option<i64>,
    pub expires_at: i64,
}

impl UploadSession {
    pub fn chunk_entries(&self) -> Vec<ChunkEntry> {
        serde_json::from_str(&self.completed_chunks).unwrap_or_default()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Expected byte length of one chunk: full-size everywhere except a
    /// short final chunk when the total is not an exact multiple.
    pub fn expected_chunk_size(&self, index: u32) -> u64 {
        let chunk_size = self.chunk_size as u64;
        let remainder = self.total_size as u64 % chunk_size;
        if index as i64 == self.total_chunks - 1 && remainder != 0 {
            remainder
        } else {
            chunk_size
        }
    }
}

/// Denormalized copy cached in the volatile store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSession {
    pub session_id: String,
    pub user_id: i64,
    pub total_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub status: String,
    pub expires_at: i64,
}

impl From<&UploadSession> for CachedSession {
    fn from(session: &UploadSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            user_id: session.user_id,
            total_size: session.total_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            status: session.status.as_str().to_string(),
            expires_at: session.expires_at,
        }
    }
}

/// Data for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: String,
    pub user_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub total_size: i64,
    pub expected_hash: Option<String>,
    pub folder_id: Option<i64>,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub expires_at: i64,
}

/// Repository for upload sessions.
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, session: &NewSession) -> Result<UploadSession> {
        let now = now_millis();
        sqlx::query(
            "INSERT INTO upload_sessions (
                session_id, user_id, filename, mime_type, total_size, expected_hash,
                folder_id, chunk_size, total_chunks, started_at, last_activity_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(session.user_id)
        .bind(&session.filename)
        .bind(&session.mime_type)
        .bind(session.total_size)
        .bind(&session.expected_hash)
        .bind(session.folder_id)
        .bind(session.chunk_size)
        .bind(session.total_chunks)
        .bind(now)
        .bind(now)
        .bind(session.expires_at)
        .execute(self.pool)
        .await?;

        self.find(&session.session_id)
            .await?
            .ok_or_else(|| StrataError::NotFound("upload session".into()))
    }

    pub async fn find(&self, session_id: &str) -> Result<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT * FROM upload_sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(session)
    }

    /// Append a chunk entry unless one for that index already exists, and
    /// advance a pending session to uploading.
    ///
    /// Returns false when the index was already journaled. The volatile
    /// chunk set is the concurrency arbiter; this journal is the durable
    /// record and tolerates brief divergence.
    pub async fn append_chunk(&self, session_id: &str, entry: &ChunkEntry) -> Result<bool> {
        let session = self
            .find(session_id)
            .await?
            .ok_or_else(|| StrataError::NotFound("upload session".into()))?;

        let mut entries = session.chunk_entries();
        if entries.iter().any(|e| e.index == entry.index) {
            return Ok(false);
        }
        entries.push(entry.clone());
        entries.sort_by_key(|e| e.index);
        let journal = serde_json::to_string(&entries)
            .map_err(|e| StrataError::Internal(format!("chunk journal encoding: {e}")))?;

        sqlx::query(
            "UPDATE upload_sessions
             SET completed_chunks = ?,
                 status = CASE WHEN status = 'pending' THEN 'uploading' ELSE status END,
                 last_activity_at = ?
             WHERE session_id = ?",
        )
        .bind(&journal)
        .bind(now_millis())
        .bind(session_id)
        .execute(self.pool)
        .await?;
        Ok(true)
    }

    pub async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE upload_sessions SET status = ?, error = ?, last_activity_at = ? WHERE session_id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now_millis())
        .bind(session_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Finalize a successful session.
    pub async fn mark_completed(
        &self,
        session_id: &str,
        file_id: &str,
        storage_tier: &str,
    ) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            "UPDATE upload_sessions
             SET status = 'completed', file_id = ?, storage_tier = ?,
                 completed_at = ?, last_activity_at = ?
             WHERE session_id = ?",
        )
        .bind(file_id)
        .bind(storage_tier)
        .bind(now)
        .bind(now)
        .bind(session_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Live sessions whose deadline has passed.
    pub async fn expired_live_batch(&self, now: i64, limit: u32) -> Result<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(
            "SELECT * FROM upload_sessions
             WHERE status IN ('pending', 'uploading', 'assembling') AND expires_at <= ?
             ORDER BY expires_at ASC
             LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(sessions)
    }

    /// Drop terminal sessions idle since before `cutoff`; the grace window
    /// that stands in for a store-side TTL index.
    pub async fn purge_terminal_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM upload_sessions
             WHERE status IN ('completed', 'failed', 'expired') AND last_activity_at <= ?",
        )
        .bind(cutoff)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::user::{NewUser, UserRepository};

    async fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserRepository::new(db.pool())
            .create(&NewUser::new("up@example.com", "password1"))
            .await
            .unwrap();
        (db, user.id)
    }

    fn new_session(user_id: i64, id: &str, total: i64, chunk: i64) -> NewSession {
        NewSession {
            session_id: id.to_string(),
            user_id,
            filename: "file.bin".into(),
            mime_type: "application/octet-stream".into(),
            total_size: total,
            expected_hash: None,
            folder_id: None,
            chunk_size: chunk,
            total_chunks: (total + chunk - 1) / chunk,
            expires_at: now_millis() + 60_000,
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Uploading.is_terminal());
        assert!(!SessionStatus::Assembling.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Uploading,
            SessionStatus::Assembling,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let (db, user_id) = setup().await;
        let repo = SessionRepository::new(db.pool());
        let created = repo.insert(&new_session(user_id, "s1", 25, 10)).await.unwrap();

        assert_eq!(created.status, SessionStatus::Pending);
        assert_eq!(created.total_chunks, 3);
        assert!(created.chunk_entries().is_empty());
        assert!(repo.find("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expected_chunk_size() {
        let (db, user_id) = setup().await;
        let repo = SessionRepository::new(db.pool());
        let session = repo.insert(&new_session(user_id, "s2", 25, 10)).await.unwrap();

        assert_eq!(session.expected_chunk_size(0), 10);
        assert_eq!(session.expected_chunk_size(1), 10);
        assert_eq!(session.expected_chunk_size(2), 5);

        // Exact multiple: every chunk full-sized.
        let aligned = repo.insert(&new_session(user_id, "s3", 30, 10)).await.unwrap();
        assert_eq!(aligned.expected_chunk_size(2), 10);
    }

    #[tokio::test]
    async fn test_append_chunk_advances_and_dedupes() {
        let (db, user_id) = setup().await;
        let repo = SessionRepository::new(db.pool());
        repo.insert(&new_session(user_id, "s4", 25, 10)).await.unwrap();

        let entry = ChunkEntry {
            index: 1,
            size: 10,
            hash: "abc".into(),
            completed_at: now_millis(),
        };
        assert!(repo.append_chunk("s4", &entry).await.unwrap());
        assert!(!repo.append_chunk("s4", &entry).await.unwrap());

        let session = repo.find("s4").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Uploading);
        let entries = session.chunk_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 1);
    }

    #[tokio::test]
    async fn test_journal_sorted_by_index() {
        let (db, user_id) = setup().await;
        let repo = SessionRepository::new(db.pool());
        repo.insert(&new_session(user_id, "s5", 25, 10)).await.unwrap();

        for index in [2u32, 0, 1] {
            repo.append_chunk(
                "s5",
                &ChunkEntry {
                    index,
                    size: 10,
                    hash: "h".into(),
                    completed_at: now_millis(),
                },
            )
            .await
            .unwrap();
        }

        let indices: Vec<u32> = repo
            .find("s5")
            .await
            .unwrap()
            .unwrap()
            .chunk_entries()
            .iter()
            .map(|e| e.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_expired_live_batch() {
        let (db, user_id) = setup().await;
        let repo = SessionRepository::new(db.pool());

        let mut stale = new_session(user_id, "stale", 10, 10);
        stale.expires_at = now_millis() - 1_000;
        repo.insert(&stale).await.unwrap();

        let mut finished = new_session(user_id, "finished", 10, 10);
        finished.expires_at = now_millis() - 1_000;
        repo.insert(&finished).await.unwrap();
        repo.set_status("finished", SessionStatus::Failed, Some("ABORTED"))
            .await
            .unwrap();

        repo.insert(&new_session(user_id, "fresh", 10, 10)).await.unwrap();

        let batch = repo.expired_live_batch(now_millis(), 10).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["stale"]);
    }

    #[tokio::test]
    async fn test_purge_terminal() {
        let (db, user_id) = setup().await;
        let repo = SessionRepository::new(db.pool());

        repo.insert(&new_session(user_id, "old-done", 10, 10)).await.unwrap();
        repo.set_status("old-done", SessionStatus::Completed, None)
            .await
            .unwrap();
        repo.insert(&new_session(user_id, "live", 10, 10)).await.unwrap();

        // Nothing is old enough yet.
        assert_eq!(
            repo.purge_terminal_before(now_millis() - 60_000).await.unwrap(),
            0
        );
        // A future cutoff catches the terminal one but never the live one.
        assert_eq!(
            repo.purge_terminal_before(now_millis() + 60_000).await.unwrap(),
            1
        );
        assert!(repo.find("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_completed() {
        let (db, user_id) = setup().await;
        let repo = SessionRepository::new(db.pool());
        repo.insert(&new_session(user_id, "s6", 10, 10)).await.unwrap();

        repo.mark_completed("s6", "file-123", "hot").await.unwrap();
        let session = repo.find("s6").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.file_id.as_deref(), Some("file-123"));
        assert_eq!(session.storage_tier.as_deref(), Some("hot"));
        assert!(session.completed_at.is_some());
    }
}
