//! User accounts and roles.
//!
//! The core consumes an authenticated principal; what lives here is the
//! account record the storage engines depend on: role tier, active flag,
//! lockout bookkeeping, quota overrides, and the capped refresh-token list.

mod password;
mod repository;

pub use password::{hash_password, verify_password};
pub use repository::{NewUser, RefreshToken, UserRepository};

use std::fmt;
use std::str::FromStr;

/// Account role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Role {
    /// Free tier: quota limits and file expiry apply.
    #[default]
    Free = 0,
    /// Paying tier: unlimited quota, files never expire.
    Premium = 1,
    /// Operator: premium privileges plus access to any file.
    Admin = 2,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Free => "free",
            Role::Premium => "premium",
            Role::Admin => "admin",
        }
    }

    /// Premium and admin files never expire and never migrate to cold.
    pub fn is_unlimited(&self) -> bool {
        *self >= Role::Premium
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Role::Free),
            "premium" => Ok(Role::Premium),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Full user record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    /// Unique, stored lowercased.
    pub email: String,
    /// Argon2id hash.
    pub password_hash: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub is_active: bool,
    pub last_login: Option<i64>,
    pub failed_login_attempts: i64,
    pub lockout_until: Option<i64>,
    /// Per-user storage cap overriding the role default; -1 = unlimited.
    pub quota_max_storage: Option<i64>,
    /// Per-user single-file cap overriding the role default; -1 = unlimited.
    pub quota_max_file_size: Option<i64>,
    pub created_at: i64,
}

impl User {
    /// True while a lockout deadline lies in the future.
    pub fn is_locked(&self, now: i64) -> bool {
        self.lockout_until.map(|t| t > now).unwrap_or(false)
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            role: self.role,
            quota_max_storage: self.quota_max_storage,
            quota_max_file_size: self.quota_max_file_size,
        }
    }
}

/// Role-only view of a user.
///
/// The upload and download engines depend on this, not on the full account
/// record, which keeps the layering acyclic.
#[derive(Debug, Clone, Copy)]
pub struct UserProfile {
    pub id: i64,
    pub role: Role,
    pub quota_max_storage: Option<i64>,
    pub quota_max_file_size: Option<i64>,
}
