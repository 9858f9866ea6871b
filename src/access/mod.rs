//! Unified access decision for downloads.

use sqlx::SqlitePool;

use crate::file::FileRecord;
use crate::user::{Role, UserRepository};
use crate::{Result, StrataError};

/// Compare two byte strings without short-circuiting on the first
/// difference. Length mismatches still compare every position.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Access policy for file downloads.
///
/// - Public and passwordless: anyone.
/// - Password-protected: whoever supplies the matching password.
/// - Private: the owner, or an admin.
pub struct AccessPolicy {
    pool: SqlitePool,
}

impl AccessPolicy {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn check(
        &self,
        file: &FileRecord,
        user_id: Option<i64>,
        password: Option<&str>,
    ) -> Result<()> {
        if file.is_public && file.password.is_none() {
            return Ok(());
        }

        if let Some(stored) = &file.password {
            return match password {
                Some(supplied) if constant_time_eq(supplied.as_bytes(), stored.as_bytes()) => {
                    Ok(())
                }
                Some(_) => Err(StrataError::Authorization(
                    "incorrect file password".into(),
                )),
                None => Err(StrataError::Authorization(
                    "this file requires a password".into(),
                )),
            };
        }

        let user_id = user_id.ok_or_else(|| {
            StrataError::Authentication("authentication required for this file".into())
        })?;

        if user_id == file.user_id {
            return Ok(());
        }

        let caller = UserRepository::new(&self.pool)
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| StrataError::Authorization("access denied".into()))?;
        if caller.role == Role::Admin {
            Ok(())
        } else {
            Err(StrataError::Authorization("access denied".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::storage::StorageTier;
    use crate::user::NewUser;

    fn file_record(owner: i64, is_public: bool, password: Option<&str>) -> FileRecord {
        FileRecord {
            id: "f".into(),
            user_id: owner,
            folder_id: None,
            storage_key: "k".into(),
            original_name: "n.bin".into(),
            mime_type: "application/octet-stream".into(),
            size: 1,
            hash: "h".into(),
            storage_tier: StorageTier::Hot,
            downloads: 0,
            last_download_at: None,
            last_access_at: 0,
            expires_at: None,
            is_public,
            password: password.map(String::from),
            is_deleted: false,
            deleted_at: None,
            migration_status: Default::default(),
            last_migration_at: None,
            metadata: "{}".into(),
            created_at: 0,
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn test_public_no_password_allows_anonymous() {
        let db = Database::open_in_memory().await.unwrap();
        let policy = AccessPolicy::new(db.pool().clone());
        let file = file_record(1, true, None);
        policy.check(&file, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_password_gate() {
        let db = Database::open_in_memory().await.unwrap();
        let policy = AccessPolicy::new(db.pool().clone());
        let file = file_record(1, true, Some("open sesame"));

        policy
            .check(&file, None, Some("open sesame"))
            .await
            .unwrap();

        let err = policy.check(&file, None, Some("wrong")).await.unwrap_err();
        assert_eq!(err.code(), "AUTHORIZATION_ERROR");

        let err = policy.check(&file, None, None).await.unwrap_err();
        assert_eq!(err.code(), "AUTHORIZATION_ERROR");
    }

    #[tokio::test]
    async fn test_private_owner_admin_other() {
        let db = Database::open_in_memory().await.unwrap();
        let users = UserRepository::new(db.pool());
        let owner = users
            .create(&NewUser::new("owner@example.com", "password1"))
            .await
            .unwrap();
        let admin = users
            .create(&NewUser::new("admin@example.com", "password1").with_role(Role::Admin))
            .await
            .unwrap();
        let other = users
            .create(&NewUser::new("other@example.com", "password1"))
            .await
            .unwrap();

        let policy = AccessPolicy::new(db.pool().clone());
        let file = file_record(owner.id, false, None);

        policy.check(&file, Some(owner.id), None).await.unwrap();
        policy.check(&file, Some(admin.id), None).await.unwrap();

        let err = policy
            .check(&file, Some(other.id), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTHORIZATION_ERROR");

        let err = policy.check(&file, None, None).await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_ERROR");
    }
}
