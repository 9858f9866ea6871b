//! Two-tier filesystem object storage.
//!
//! Objects live in a sharded directory layout keyed by storage tier and
//! opaque storage key:
//!
//! ```text
//! {base_path}/
//! ├── ssd/                  <- hot tier
//! │   ├── ab/
//! │   │   └── ab12...key
//! │   └── temp/             <- chunk staging
//! │       └── {session_id}/
//! │           ├── 0
//! │           └── 1
//! └── hdd/                  <- cold tier
//!     └── cd/
//!         └── cd34...key
//! ```
//!
//! This layer reports typed errors and never retries; callers decide.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::{Result, StrataError};

/// Storage tier an object lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Fast tier (SSD path).
    #[default]
    Hot,
    /// Slow tier (HDD path).
    Cold,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Hot => "hot",
            StorageTier::Cold => "cold",
        }
    }

    /// On-disk directory name for the tier.
    pub fn dir_name(&self) -> &'static str {
        match self {
            StorageTier::Hot => "ssd",
            StorageTier::Cold => "hdd",
        }
    }

    pub fn opposite(&self) -> StorageTier {
        match self {
            StorageTier::Hot => StorageTier::Cold,
            StorageTier::Cold => StorageTier::Hot,
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hot" => Ok(StorageTier::Hot),
            "cold" => Ok(StorageTier::Cold),
            _ => Err(format!("unknown storage tier: {s}")),
        }
    }
}

impl TryFrom<String> for StorageTier {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Result of assembling a session's chunks into one object.
#[derive(Debug, Clone)]
pub struct AssembledObject {
    /// Final object size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the object content.
    pub hash: String,
}

/// A bounded byte stream over part of a stored object.
#[derive(Debug)]
pub struct RangeStream {
    reader: tokio::io::Take<fs::File>,
    length: u64,
}

impl RangeStream {
    /// Number of bytes this stream yields.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The underlying bounded reader.
    pub fn into_reader(self) -> tokio::io::Take<fs::File> {
        self.reader
    }

    /// Drain the stream into memory. Intended for tests and small bodies.
    pub async fn collect(mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Per-tier usage numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub objects: u64,
    pub bytes: u64,
}

/// Snapshot of backend usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    pub hot: TierStats,
    pub cold: TierStats,
}

/// Filesystem storage backend with a hot and a cold tier.
#[derive(Debug, Clone)]
pub struct StorageBackend {
    base_path: PathBuf,
}

const COPY_BUF_SIZE: usize = 64 * 1024;

impl StorageBackend {
    /// Create a backend rooted at `base_path`, creating tier directories.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        for tier in [StorageTier::Hot, StorageTier::Cold] {
            std::fs::create_dir_all(base_path.join(tier.dir_name()))?;
        }
        std::fs::create_dir_all(base_path.join(StorageTier::Hot.dir_name()).join("temp"))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Full path of an object: `{base}/{tier}/{first-2}/{key}`.
    pub fn object_path(&self, storage_key: &str, tier: StorageTier) -> PathBuf {
        let shard = if storage_key.len() >= 2 {
            &storage_key[..2]
        } else {
            storage_key
        };
        self.base_path
            .join(tier.dir_name())
            .join(shard)
            .join(storage_key)
    }

    /// Staging directory for a session's chunks.
    pub fn chunk_dir(&self, session_id: &str) -> PathBuf {
        self.base_path
            .join(StorageTier::Hot.dir_name())
            .join("temp")
            .join(session_id)
    }

    fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.chunk_dir(session_id).join(index.to_string())
    }

    /// Persist one chunk atomically (write-temp-then-rename).
    pub async fn write_chunk(&self, session_id: &str, index: u32, bytes: &[u8]) -> Result<()> {
        let dir = self.chunk_dir(session_id);
        fs::create_dir_all(&dir).await?;

        let final_path = self.chunk_path(session_id, index);
        let temp_path = dir.join(format!("{index}.part"));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &final_path).await?;
        Ok(())
    }

    /// True when the staged chunk exists.
    pub async fn chunk_exists(&self, session_id: &str, index: u32) -> bool {
        fs::metadata(self.chunk_path(session_id, index)).await.is_ok()
    }

    /// Stream chunks `0..total_chunks` in index order into the destination
    /// object, computing SHA-256 alongside the writes.
    ///
    /// On any failure the partial destination is removed before the error
    /// propagates. Staged chunks are left in place; the caller removes them.
    pub async fn assemble_chunks(
        &self,
        session_id: &str,
        storage_key: &str,
        total_chunks: u32,
        tier: StorageTier,
    ) -> Result<AssembledObject> {
        let dest = self.object_path(storage_key, tier);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = dest.with_extension("part");

        let result = self
            .assemble_into(session_id, &staging, total_chunks)
            .await;

        match result {
            Ok(assembled) => {
                fs::rename(&staging, &dest).await?;
                Ok(assembled)
            }
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn assemble_into(
        &self,
        session_id: &str,
        staging: &Path,
        total_chunks: u32,
    ) -> Result<AssembledObject> {
        let mut out = fs::File::create(staging).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        for index in 0..total_chunks {
            let path = self.chunk_path(session_id, index);
            let mut chunk = match fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StrataError::NotFound(format!(
                        "chunk {index} of session {session_id}"
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n]).await?;
                size += n as u64;
            }
        }

        out.sync_all().await?;
        Ok(AssembledObject {
            size,
            hash: format!("{:x}", hasher.finalize()),
        })
    }

    /// Remove a session's staging directory. Missing directories are fine.
    pub async fn delete_chunks(&self, session_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.chunk_dir(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List staged session directories with their modification times.
    pub async fn list_chunk_sessions(&self) -> Result<Vec<(String, SystemTime)>> {
        let temp = self
            .base_path
            .join(StorageTier::Hot.dir_name())
            .join("temp");
        let mut sessions = Vec::new();
        let mut entries = match fs::read_dir(&temp).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                sessions.push((name.to_string(), mtime));
            }
        }
        Ok(sessions)
    }

    /// Open a bounded stream over the inclusive byte range `[start, end]`.
    ///
    /// Defaults cover the whole object. `end` past the object or a start
    /// beyond the end yields INVALID_RANGE.
    pub async fn open_range(
        &self,
        storage_key: &str,
        tier: StorageTier,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<RangeStream> {
        let path = self.object_path(storage_key, tier);
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StrataError::NotFound(format!("object {storage_key}")));
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata().await?.len();
        if size == 0 {
            return Err(StrataError::Storage(format!(
                "object {storage_key} is empty"
            )));
        }

        let start = start.unwrap_or(0);
        let end = end.unwrap_or(size - 1);
        if start > end || end >= size {
            return Err(StrataError::InvalidRange(format!(
                "{start}-{end} outside 0-{}",
                size - 1
            )));
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let length = end - start + 1;
        Ok(RangeStream {
            reader: file.take(length),
            length,
        })
    }

    /// Delete an object. Returns false when it was already absent.
    pub async fn delete(&self, storage_key: &str, tier: StorageTier) -> Result<bool> {
        match fs::remove_file(self.object_path(storage_key, tier)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True when the object exists on the given tier.
    pub async fn exists(&self, storage_key: &str, tier: StorageTier) -> bool {
        fs::metadata(self.object_path(storage_key, tier)).await.is_ok()
    }

    /// Move an object between tiers.
    ///
    /// Rename when the tiers share a device; otherwise stream-copy, confirm
    /// the target is durable, then unlink the source. The source survives
    /// every failure mode.
    pub async fn migrate(
        &self,
        storage_key: &str,
        source_tier: StorageTier,
        target_tier: StorageTier,
    ) -> Result<()> {
        let source = self.object_path(storage_key, source_tier);
        let target = self.object_path(storage_key, target_tier);

        if fs::metadata(&source).await.is_err() {
            return Err(StrataError::NotFound(format!(
                "object {storage_key} on {source_tier}"
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::rename(&source, &target).await {
            Ok(()) => {
                debug!(%storage_key, %source_tier, %target_tier, "migrated via rename");
                Ok(())
            }
            Err(_) => {
                // Cross-device: copy, fsync the target, then drop the source.
                fs::copy(&source, &target).await?;
                let target_file = fs::File::open(&target).await?;
                target_file.sync_all().await?;
                drop(target_file);
                fs::remove_file(&source).await?;
                debug!(%storage_key, %source_tier, %target_tier, "migrated via copy");
                Ok(())
            }
        }
    }

    /// Count objects and bytes per tier.
    pub async fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            hot: self.tier_stats(StorageTier::Hot).await?,
            cold: self.tier_stats(StorageTier::Cold).await?,
        })
    }

    async fn tier_stats(&self, tier: StorageTier) -> Result<TierStats> {
        let root = self.base_path.join(tier.dir_name());
        let mut stats = TierStats::default();

        let mut shards = fs::read_dir(&root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.metadata().await?.is_dir() {
                continue;
            }
            if shard.file_name() == "temp" {
                continue;
            }
            let mut objects = fs::read_dir(shard.path()).await?;
            while let Some(object) = objects.next_entry().await? {
                let meta = object.metadata().await?;
                if meta.is_file() {
                    stats.objects += 1;
                    stats.bytes += meta.len();
                }
            }
        }
        Ok(stats)
    }

    /// Probe that the base path is writable.
    pub async fn health_check(&self) -> Result<()> {
        let probe = self
            .base_path
            .join(format!(".health-{}", uuid::Uuid::new_v4()));
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StorageBackend) {
        let dir = TempDir::new().unwrap();
        let backend = StorageBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    fn sha256_hex(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    #[test]
    fn test_new_creates_tier_dirs() {
        let (dir, _backend) = setup();
        assert!(dir.path().join("ssd").is_dir());
        assert!(dir.path().join("hdd").is_dir());
        assert!(dir.path().join("ssd/temp").is_dir());
    }

    #[test]
    fn test_object_path_sharding() {
        let (dir, backend) = setup();
        let path = backend.object_path("abcdef.txt", StorageTier::Hot);
        assert_eq!(path, dir.path().join("ssd").join("ab").join("abcdef.txt"));
        let path = backend.object_path("x", StorageTier::Cold);
        assert_eq!(path, dir.path().join("hdd").join("x").join("x"));
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("hot".parse::<StorageTier>().unwrap(), StorageTier::Hot);
        assert_eq!("COLD".parse::<StorageTier>().unwrap(), StorageTier::Cold);
        assert!("warm".parse::<StorageTier>().is_err());
        assert_eq!(StorageTier::Hot.dir_name(), "ssd");
        assert_eq!(StorageTier::Cold.dir_name(), "hdd");
        assert_eq!(StorageTier::Hot.opposite(), StorageTier::Cold);
    }

    #[tokio::test]
    async fn test_write_chunk_and_exists() {
        let (_dir, backend) = setup();
        backend.write_chunk("sess", 0, b"hello").await.unwrap();
        assert!(backend.chunk_exists("sess", 0).await);
        assert!(!backend.chunk_exists("sess", 1).await);
    }

    #[tokio::test]
    async fn test_write_chunk_leaves_no_temp_file() {
        let (_dir, backend) = setup();
        backend.write_chunk("sess", 3, b"data").await.unwrap();
        let dir = backend.chunk_dir("sess");
        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["3"]);
    }

    #[tokio::test]
    async fn test_assemble_in_index_order() {
        let (_dir, backend) = setup();
        let parts: [&[u8]; 3] = [b"alpha-", b"beta-", b"gamma"];
        // Written out of order; assembly must still follow index order.
        backend.write_chunk("s1", 2, parts[2]).await.unwrap();
        backend.write_chunk("s1", 0, parts[0]).await.unwrap();
        backend.write_chunk("s1", 1, parts[1]).await.unwrap();

        let assembled = backend
            .assemble_chunks("s1", "k1file.bin", 3, StorageTier::Hot)
            .await
            .unwrap();

        let full = b"alpha-beta-gamma";
        assert_eq!(assembled.size, full.len() as u64);
        assert_eq!(assembled.hash, sha256_hex(full));

        let content = std::fs::read(backend.object_path("k1file.bin", StorageTier::Hot)).unwrap();
        assert_eq!(content, full);
    }

    #[tokio::test]
    async fn test_assemble_missing_chunk_cleans_partial() {
        let (_dir, backend) = setup();
        backend.write_chunk("s2", 0, b"only").await.unwrap();

        let err = backend
            .assemble_chunks("s2", "k2file.bin", 2, StorageTier::Hot)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let dest = backend.object_path("k2file.bin", StorageTier::Hot);
        assert!(!dest.exists());
        assert!(!dest.with_extension("part").exists());
    }

    #[tokio::test]
    async fn test_delete_chunks_idempotent() {
        let (_dir, backend) = setup();
        backend.write_chunk("s3", 0, b"x").await.unwrap();
        backend.delete_chunks("s3").await.unwrap();
        assert!(!backend.chunk_dir("s3").exists());
        backend.delete_chunks("s3").await.unwrap();
    }

    #[tokio::test]
    async fn test_open_range_full_and_partial() {
        let (_dir, backend) = setup();
        let data: Vec<u8> = (0..=255).cycle().take(1000).map(|b: u16| b as u8).collect();
        backend.write_chunk("s4", 0, &data).await.unwrap();
        backend
            .assemble_chunks("s4", "k4file.bin", 1, StorageTier::Hot)
            .await
            .unwrap();

        let full = backend
            .open_range("k4file.bin", StorageTier::Hot, None, None)
            .await
            .unwrap();
        assert_eq!(full.len(), 1000);
        assert_eq!(full.collect().await.unwrap(), data);

        let partial = backend
            .open_range("k4file.bin", StorageTier::Hot, Some(100), Some(199))
            .await
            .unwrap();
        assert_eq!(partial.len(), 100);
        assert_eq!(partial.collect().await.unwrap(), &data[100..200]);
    }

    #[tokio::test]
    async fn test_open_range_bounds() {
        let (_dir, backend) = setup();
        backend.write_chunk("s5", 0, &[7u8; 10]).await.unwrap();
        backend
            .assemble_chunks("s5", "k5file.bin", 1, StorageTier::Hot)
            .await
            .unwrap();

        let err = backend
            .open_range("k5file.bin", StorageTier::Hot, Some(5), Some(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_RANGE");

        let err = backend
            .open_range("k5file.bin", StorageTier::Hot, Some(8), Some(3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_RANGE");

        let err = backend
            .open_range("missing", StorageTier::Hot, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_delete_object() {
        let (_dir, backend) = setup();
        backend.write_chunk("s6", 0, b"bytes").await.unwrap();
        backend
            .assemble_chunks("s6", "k6file.bin", 1, StorageTier::Hot)
            .await
            .unwrap();

        assert!(backend.delete("k6file.bin", StorageTier::Hot).await.unwrap());
        assert!(!backend.exists("k6file.bin", StorageTier::Hot).await);
        assert!(!backend.delete("k6file.bin", StorageTier::Hot).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_between_tiers() {
        let (_dir, backend) = setup();
        backend.write_chunk("s7", 0, b"to move").await.unwrap();
        backend
            .assemble_chunks("s7", "k7file.bin", 1, StorageTier::Hot)
            .await
            .unwrap();

        backend
            .migrate("k7file.bin", StorageTier::Hot, StorageTier::Cold)
            .await
            .unwrap();

        assert!(!backend.exists("k7file.bin", StorageTier::Hot).await);
        assert!(backend.exists("k7file.bin", StorageTier::Cold).await);

        let content = backend
            .open_range("k7file.bin", StorageTier::Cold, None, None)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(content, b"to move");
    }

    #[tokio::test]
    async fn test_migrate_missing_source() {
        let (_dir, backend) = setup();
        let err = backend
            .migrate("ghost", StorageTier::Hot, StorageTier::Cold)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_stats_exclude_staging() {
        let (_dir, backend) = setup();
        backend.write_chunk("s8", 0, b"1234").await.unwrap();
        backend
            .assemble_chunks("s8", "k8file.bin", 1, StorageTier::Hot)
            .await
            .unwrap();
        backend.write_chunk("pending", 0, b"staged").await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.hot.objects, 1);
        assert_eq!(stats.hot.bytes, 4);
        assert_eq!(stats.cold, TierStats::default());
    }

    #[tokio::test]
    async fn test_list_chunk_sessions() {
        let (_dir, backend) = setup();
        backend.write_chunk("sess-a", 0, b"x").await.unwrap();
        backend.write_chunk("sess-b", 0, b"y").await.unwrap();

        let mut sessions: Vec<String> = backend
            .list_chunk_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        sessions.sort();
        assert_eq!(sessions, vec!["sess-a", "sess-b"]);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, backend) = setup();
        backend.health_check().await.unwrap();
    }
}
