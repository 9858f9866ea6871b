//! User repository: account records, login bookkeeping, refresh tokens.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::datetime::{now_millis, MINUTE_MS};
use crate::{Result, StrataError};

use super::{hash_password, verify_password, Role, User, UserProfile};

/// Consecutive failures that trigger a lockout.
pub const MAX_FAILED_LOGINS: i64 = 5;

/// Lockout duration after too many failures.
pub const LOCKOUT_MS: i64 = 15 * MINUTE_MS;

/// Refresh tokens retained per user; the oldest is evicted on overflow.
pub const MAX_REFRESH_TOKENS: i64 = 5;

/// Data for creating a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub role: Role,
}

impl NewUser {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            role: Role::Free,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

/// Stored refresh token. The token column holds a SHA-256 hash; the raw
/// value is only ever known to the client.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshToken {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub expires_at: i64,
    pub created_at: i64,
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Repository for user operations.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a user. The email is lowercased; duplicates are a CONFLICT.
    pub async fn create(&self, new_user: &NewUser) -> Result<User> {
        let email = new_user.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(StrataError::Validation("invalid email address".into()));
        }
        let password_hash = hash_password(&new_user.password)?;

        let result = sqlx::query(
            "INSERT INTO users (email, password_hash, role, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&email)
        .bind(&password_hash)
        .bind(new_user.role.as_str())
        .bind(now_millis())
        .execute(self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StrataError::Conflict(format!(
                    "email {email} is already registered"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let id = result.last_insert_rowid();
        self.find_by_id(id)
            .await?
            .ok_or_else(|| StrataError::NotFound("user".into()))
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(user)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email.trim().to_lowercase())
            .fetch_optional(self.pool)
            .await?;
        Ok(user)
    }

    /// Role-only view the engines depend on.
    pub async fn profile(&self, id: i64) -> Result<UserProfile> {
        let user = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| StrataError::NotFound("user".into()))?;
        if !user.is_active {
            return Err(StrataError::Authorization("account is deactivated".into()));
        }
        Ok(user.profile())
    }

    /// Verify credentials, maintaining the lockout counters.
    ///
    /// Five consecutive failures lock the account for fifteen minutes; any
    /// success resets both the counter and the deadline.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let now = now_millis();
        let user = self
            .find_by_email(email)
            .await?
            .ok_or_else(|| StrataError::Authentication("invalid credentials".into()))?;

        if !user.is_active {
            return Err(StrataError::Authentication("account is deactivated".into()));
        }
        if user.is_locked(now) {
            return Err(StrataError::Authentication(
                "account is temporarily locked".into(),
            ));
        }

        if verify_password(password, &user.password_hash) {
            self.record_login_success(user.id).await?;
            self.find_by_id(user.id)
                .await?
                .ok_or_else(|| StrataError::NotFound("user".into()))
        } else {
            self.record_login_failure(user.id).await?;
            Err(StrataError::Authentication("invalid credentials".into()))
        }
    }

    /// Bump the failure counter; the fifth consecutive failure sets the
    /// lockout deadline.
    pub async fn record_login_failure(&self, user_id: i64) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            "UPDATE users
             SET failed_login_attempts = failed_login_attempts + 1,
                 lockout_until = CASE
                     WHEN failed_login_attempts + 1 >= ? THEN ?
                     ELSE lockout_until
                 END
             WHERE id = ?",
        )
        .bind(MAX_FAILED_LOGINS)
        .bind(now + LOCKOUT_MS)
        .bind(user_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Reset the failure counter and lockout, stamp the login time.
    pub async fn record_login_success(&self, user_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE users
             SET failed_login_attempts = 0, lockout_until = NULL, last_login = ?
             WHERE id = ?",
        )
        .bind(now_millis())
        .bind(user_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Store a refresh token (hashed), evicting the oldest beyond the cap.
    pub async fn add_refresh_token(
        &self,
        user_id: i64,
        token: &str,
        expires_at: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO refresh_tokens (user_id, token, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(hash_token(token))
        .bind(expires_at)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM refresh_tokens
             WHERE user_id = ?
               AND id NOT IN (
                   SELECT id FROM refresh_tokens
                   WHERE user_id = ?
                   ORDER BY created_at DESC, id DESC
                   LIMIT ?
               )",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(MAX_REFRESH_TOKENS)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Look up a live refresh token by its raw value.
    pub async fn find_refresh_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        let row = sqlx::query_as::<_, RefreshToken>(
            "SELECT * FROM refresh_tokens WHERE token = ? AND expires_at > ?",
        )
        .bind(hash_token(token))
        .bind(now_millis())
        .fetch_optional(self.pool)
        .await?;
        Ok(row)
    }

    pub async fn refresh_token_count(&self, user_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM refresh_tokens WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(self.pool)
                .await?;
        Ok(count)
    }

    /// Set per-user quota overrides (`None` clears back to the role default).
    pub async fn set_quota_override(
        &self,
        user_id: i64,
        max_storage: Option<i64>,
        max_file_size: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET quota_max_storage = ?, quota_max_file_size = ? WHERE id = ?")
            .bind(max_storage)
            .bind(max_file_size)
            .bind(user_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}
