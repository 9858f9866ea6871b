//! Schema migrations for strata.
//!
//! Each entry runs inside one transaction; statements are `;`-separated.
//! Timestamps are Unix epoch milliseconds stored as INTEGER.

/// Ordered list of migrations. Version N is `MIGRATIONS[N-1]`.
pub const MIGRATIONS: &[&str] = &[
    // v1: full initial schema.
    r#"
    CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'free',
        is_active INTEGER NOT NULL DEFAULT 1,
        last_login INTEGER,
        failed_login_attempts INTEGER NOT NULL DEFAULT 0,
        lockout_until INTEGER,
        quota_max_storage INTEGER,
        quota_max_file_size INTEGER,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE refresh_tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        token TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX idx_refresh_tokens_user ON refresh_tokens(user_id, created_at);

    CREATE TABLE files (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        folder_id INTEGER,
        storage_key TEXT NOT NULL UNIQUE,
        original_name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size INTEGER NOT NULL,
        hash TEXT NOT NULL,
        storage_tier TEXT NOT NULL DEFAULT 'hot',
        downloads INTEGER NOT NULL DEFAULT 0,
        last_download_at INTEGER,
        last_access_at INTEGER NOT NULL,
        expires_at INTEGER,
        is_public INTEGER NOT NULL DEFAULT 0,
        password TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at INTEGER,
        migration_status TEXT NOT NULL DEFAULT 'none',
        last_migration_at INTEGER,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL
    );
    CREATE INDEX idx_files_user ON files(user_id);
    CREATE INDEX idx_files_user_deleted ON files(user_id, is_deleted);
    CREATE INDEX idx_files_expires ON files(expires_at, is_deleted);
    CREATE INDEX idx_files_tier_access ON files(storage_tier, last_access_at);
    CREATE INDEX idx_files_downloads_tier ON files(downloads, storage_tier);
    CREATE INDEX idx_files_folder ON files(folder_id);

    CREATE TABLE folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        parent_id INTEGER REFERENCES folders(id),
        path TEXT NOT NULL,
        depth INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(user_id, path)
    );
    CREATE INDEX idx_folders_user_parent ON folders(user_id, parent_id);

    CREATE TABLE upload_sessions (
        session_id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        filename TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        total_size INTEGER NOT NULL,
        expected_hash TEXT,
        folder_id INTEGER,
        chunk_size INTEGER NOT NULL,
        total_chunks INTEGER NOT NULL,
        completed_chunks TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'pending',
        error TEXT,
        file_id TEXT,
        storage_tier TEXT,
        started_at INTEGER NOT NULL,
        last_activity_at INTEGER NOT NULL,
        completed_at INTEGER,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX idx_sessions_status_expiry ON upload_sessions(status, expires_at);
    CREATE INDEX idx_sessions_user ON upload_sessions(user_id);

    CREATE TABLE quotas (
        user_id INTEGER PRIMARY KEY REFERENCES users(id),
        max_storage INTEGER,
        max_file_size INTEGER,
        max_files INTEGER,
        used_storage INTEGER NOT NULL DEFAULT 0,
        used_files INTEGER NOT NULL DEFAULT 0,
        bandwidth_daily INTEGER NOT NULL DEFAULT 0,
        bandwidth_monthly INTEGER NOT NULL DEFAULT 0,
        bandwidth_last_reset INTEGER NOT NULL,
        is_over_quota INTEGER NOT NULL DEFAULT 0,
        over_quota_since INTEGER
    )
    "#,
];
