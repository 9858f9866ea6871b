//! Folder hierarchy with denormalized path strings.
//!
//! Every folder carries its absolute slash-delimited `path` (`/a/b`) and a
//! derived `depth`; `(user_id, path)` is unique. Moves and renames cascade
//! the new prefix to every descendant inside one transaction. Cycles are
//! refused by walking the ancestor chain of the target parent.

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use crate::datetime::now_millis;
use crate::file::{FileRecord, FileRepository, FileSort};
use crate::quota::QuotaAccountant;
use crate::sanitize::sanitize_folder_name;
use crate::storage::StorageBackend;
use crate::user::UserRepository;
use crate::{Result, StrataError};

/// A folder record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    /// Absolute path, e.g. `/docs/reports`.
    pub path: String,
    pub depth: i64,
    pub created_at: i64,
}

/// Listing options for folder contents.
#[derive(Debug, Clone, Copy)]
pub struct ContentsOptions {
    pub page: u32,
    pub limit: u32,
    pub sort: FileSort,
}

impl Default for ContentsOptions {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 50,
            sort: FileSort::Date,
        }
    }
}

/// Folders plus files directly under one parent.
#[derive(Debug)]
pub struct FolderContents {
    pub folders: Vec<Folder>,
    pub files: Vec<FileRecord>,
}

fn depth_of(path: &str) -> i64 {
    path.chars().filter(|c| *c == '/').count() as i64 - 1
}

/// Folder hierarchy service.
pub struct FolderTree {
    pool: SqlitePool,
    backend: Arc<StorageBackend>,
    quota: QuotaAccountant,
}

impl FolderTree {
    pub fn new(pool: SqlitePool, backend: Arc<StorageBackend>, quota: QuotaAccountant) -> Self {
        Self {
            pool,
            backend,
            quota,
        }
    }

    /// Create a folder under `parent_id` (root when None).
    pub async fn create(
        &self,
        user_id: i64,
        name: &str,
        parent_id: Option<i64>,
    ) -> Result<Folder> {
        let name = sanitize_folder_name(name)?;

        let parent_path = match parent_id {
            Some(pid) => {
                let parent = self
                    .find(user_id, pid)
                    .await?
                    .ok_or_else(|| StrataError::NotFound("parent folder".into()))?;
                parent.path
            }
            None => String::new(),
        };

        if self.name_taken(user_id, parent_id, &name).await? {
            return Err(StrataError::Conflict(format!(
                "a folder named {name:?} already exists here"
            )));
        }

        let path = format!("{parent_path}/{name}");
        let depth = depth_of(&path);

        let result = sqlx::query(
            "INSERT INTO folders (user_id, name, parent_id, path, depth, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&name)
        .bind(parent_id)
        .bind(&path)
        .bind(depth)
        .bind(now_millis())
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StrataError::Conflict(format!("path {path:?} already exists")));
            }
            Err(e) => return Err(e.into()),
        };

        let id = result.last_insert_rowid();
        self.find(user_id, id)
            .await?
            .ok_or_else(|| StrataError::NotFound("folder".into()))
    }

    pub async fn find(&self, user_id: i64, id: i64) -> Result<Option<Folder>> {
        let folder =
            sqlx::query_as::<_, Folder>("SELECT * FROM folders WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(folder)
    }

    async fn require(&self, user_id: i64, id: i64) -> Result<Folder> {
        self.find(user_id, id)
            .await?
            .ok_or_else(|| StrataError::NotFound("folder".into()))
    }

    async fn name_taken(&self, user_id: i64, parent_id: Option<i64>, name: &str) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM folders WHERE user_id = ? AND parent_id IS ? AND name = ?
             )",
        )
        .bind(user_id)
        .bind(parent_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }

    /// Direct children of `parent_id` (root folders when None).
    pub async fn list(&self, user_id: i64, parent_id: Option<i64>) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            "SELECT * FROM folders WHERE user_id = ? AND parent_id IS ? ORDER BY name",
        )
        .bind(user_id)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    /// Subfolders plus paginated files under one parent.
    pub async fn contents(
        &self,
        user_id: i64,
        folder_id: Option<i64>,
        options: ContentsOptions,
    ) -> Result<FolderContents> {
        if let Some(id) = folder_id {
            self.require(user_id, id).await?;
        }
        let folders = self.list(user_id, folder_id).await?;
        let files = FileRepository::new(&self.pool)
            .list_by_folder(
                user_id,
                folder_id,
                options.page.max(1),
                options.limit,
                options.sort,
            )
            .await?;
        Ok(FolderContents { folders, files })
    }

    /// Every descendant of `path`, any depth.
    async fn descendants(&self, user_id: i64, path: &str) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            "SELECT * FROM folders WHERE user_id = ? AND path LIKE ? ESCAPE '\\' ORDER BY depth",
        )
        .bind(user_id)
        .bind(format!("{}/%", escape_like(path)))
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    /// True when `candidate_parent` is `folder_id` or lies beneath it.
    async fn would_cycle(
        &self,
        user_id: i64,
        folder_id: i64,
        candidate_parent: Option<i64>,
    ) -> Result<bool> {
        let mut current = candidate_parent;
        while let Some(id) = current {
            if id == folder_id {
                return Ok(true);
            }
            current = self.require(user_id, id).await?.parent_id;
        }
        Ok(false)
    }

    /// Move a folder under a new parent, cascading paths to descendants.
    pub async fn move_folder(
        &self,
        user_id: i64,
        folder_id: i64,
        new_parent_id: Option<i64>,
    ) -> Result<Folder> {
        let folder = self.require(user_id, folder_id).await?;

        if self.would_cycle(user_id, folder_id, new_parent_id).await? {
            return Err(StrataError::Validation(
                "cannot move a folder into itself or its own subtree".into(),
            ));
        }

        let parent_path = match new_parent_id {
            Some(pid) => self.require(user_id, pid).await?.path,
            None => String::new(),
        };

        if folder.parent_id != new_parent_id
            && self.name_taken(user_id, new_parent_id, &folder.name).await?
        {
            return Err(StrataError::Conflict(format!(
                "a folder named {:?} already exists in the target",
                folder.name
            )));
        }

        let new_path = format!("{parent_path}/{}", folder.name);
        self.apply_path_change(&folder, new_parent_id, &folder.name, &new_path)
            .await?;
        self.require(user_id, folder_id).await
    }

    /// Rename a folder, cascading paths to descendants.
    pub async fn rename(&self, user_id: i64, folder_id: i64, new_name: &str) -> Result<Folder> {
        let folder = self.require(user_id, folder_id).await?;
        let new_name = sanitize_folder_name(new_name)?;

        if new_name != folder.name && self.name_taken(user_id, folder.parent_id, &new_name).await? {
            return Err(StrataError::Conflict(format!(
                "a folder named {new_name:?} already exists here"
            )));
        }

        let parent_path = match folder.path.rfind('/') {
            Some(0) | None => String::new(),
            Some(idx) => folder.path[..idx].to_string(),
        };
        let new_path = format!("{parent_path}/{new_name}");
        self.apply_path_change(&folder, folder.parent_id, &new_name, &new_path)
            .await?;
        self.require(user_id, folder_id).await
    }

    /// Rewrite the folder row and every descendant path in one transaction.
    async fn apply_path_change(
        &self,
        folder: &Folder,
        new_parent_id: Option<i64>,
        new_name: &str,
        new_path: &str,
    ) -> Result<()> {
        let descendants = self.descendants(folder.user_id, &folder.path).await?;
        let old_prefix = format!("{}/", folder.path);

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE folders SET parent_id = ?, name = ?, path = ?, depth = ? WHERE id = ?")
            .bind(new_parent_id)
            .bind(new_name)
            .bind(new_path)
            .bind(depth_of(new_path))
            .bind(folder.id)
            .execute(&mut *tx)
            .await?;

        for descendant in &descendants {
            let suffix = &descendant.path[old_prefix.len()..];
            let path = format!("{new_path}/{suffix}");
            sqlx::query("UPDATE folders SET path = ?, depth = ? WHERE id = ?")
                .bind(&path)
                .bind(depth_of(&path))
                .bind(descendant.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            folder_id = folder.id,
            old = %folder.path,
            new = %new_path,
            cascaded = descendants.len(),
            "folder path updated"
        );
        Ok(())
    }

    /// Delete a folder and everything beneath it.
    ///
    /// Files lose their blob first, then their record; quota is released
    /// only for files that were not already soft-deleted.
    pub async fn delete(&self, user_id: i64, folder_id: i64) -> Result<()> {
        let folder = self.require(user_id, folder_id).await?;
        let profile = UserRepository::new(&self.pool).profile(user_id).await?;

        // Deepest first stands in for depth-first recursion.
        let mut targets = self.descendants(user_id, &folder.path).await?;
        targets.sort_by_key(|f| std::cmp::Reverse(f.depth));
        targets.push(folder);

        let files = FileRepository::new(&self.pool);
        for target in &targets {
            for file in files.all_in_folder(user_id, target.id).await? {
                self.backend.delete(&file.storage_key, file.storage_tier).await?;
                files.delete(&file.id).await?;
                if !file.is_deleted {
                    self.quota.remove_file(&profile, file.size).await?;
                }
            }
            sqlx::query("DELETE FROM folders WHERE id = ?")
                .bind(target.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Move a file into a folder (or to the root).
    pub async fn move_file(
        &self,
        user_id: i64,
        file_id: &str,
        folder_id: Option<i64>,
    ) -> Result<()> {
        let files = FileRepository::new(&self.pool);
        let file = files
            .find_active(file_id)
            .await?
            .ok_or_else(|| StrataError::NotFound("file".into()))?;
        if file.user_id != user_id {
            return Err(StrataError::Authorization(
                "file belongs to another user".into(),
            ));
        }
        if let Some(id) = folder_id {
            self.require(user_id, id).await?;
        }
        files.set_folder(file_id, folder_id).await
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
