//! Ephemeral coordination store.
//!
//! Fast in-process key-value state with per-key TTLs: the denormalized
//! upload-session cache, chunk-completion sets, file metadata cache,
//! rate-limit windows, and abuse counters all live here. Keys are
//! namespaced by the prefixes in [`keys`].
//!
//! Degraded behavior is part of the contract: when the store is marked
//! unavailable every operation returns [`VolatileError::Unavailable`], and
//! callers decide — rate limiting fails open, cache reads become misses,
//! session operations surface SERVICE_UNAVAILABLE.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use thiserror::Error;

use crate::datetime::now_millis;

/// Key prefixes used across the service.
pub mod keys {
    /// Denormalized upload session cache.
    pub const UPLOAD_SESSION: &str = "upload_session:";
    /// Completed-chunk index set per session.
    pub const UPLOAD_CHUNKS: &str = "upload_chunks:";
    /// File metadata cache.
    pub const FILE_META: &str = "file:";
    /// Sliding-window rate limit state.
    pub const RATE_LIMIT: &str = "ratelimit:";
    /// Abuse score per IP.
    pub const ABUSE: &str = "abuse:";
    /// Revoked token registry.
    pub const BLACKLIST: &str = "blacklist:";
}

/// Errors from the volatile store.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VolatileError {
    /// Store unreachable; callers apply their degradation policy.
    #[error("volatile store unavailable")]
    Unavailable,

    /// Operation applied to a key holding another kind of value.
    #[error("wrong value type for key {0}")]
    WrongType(String),

    /// Counter operation on a non-integer value.
    #[error("value at key {0} is not an integer")]
    NotInteger(String),
}

pub type VolatileResult<T> = std::result::Result<T, VolatileError>;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    /// member -> score
    Zset(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute deadline in epoch millis; None = no expiry.
    expires_at: Option<i64>,
}

impl Entry {
    fn live(&self, now: i64) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

/// In-process ephemeral KV with TTLs, counters, hashes, sets, sorted sets.
#[derive(Debug, Default)]
pub struct VolatileStore {
    entries: RwLock<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl VolatileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate or clear an outage. Affects every subsequent operation.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn guard(&self) -> VolatileResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(VolatileError::Unavailable)
        }
    }

    /// Remove every entry whose deadline has passed.
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.live(now));
        before - entries.len()
    }

    // ---- string ops ----

    pub fn get(&self, key: &str) -> VolatileResult<Option<String>> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Text(s) => Ok(Some(s.clone())),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> VolatileResult<()> {
        self.guard()?;
        self.entries.write().unwrap().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.into()),
                expires_at: None,
            },
        );
        Ok(())
    }

    pub fn set_ex(&self, key: &str, value: impl Into<String>, ttl_secs: u64) -> VolatileResult<()> {
        self.guard()?;
        self.entries.write().unwrap().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.into()),
                expires_at: Some(now_millis() + ttl_secs as i64 * 1000),
            },
        );
        Ok(())
    }

    pub fn delete(&self, key: &str) -> VolatileResult<bool> {
        self.guard()?;
        Ok(self.entries.write().unwrap().remove(key).is_some())
    }

    pub fn exists(&self, key: &str) -> VolatileResult<bool> {
        self.guard()?;
        let now = now_millis();
        Ok(self
            .entries
            .read()
            .unwrap()
            .get(key)
            .map(|e| e.live(now))
            .unwrap_or(false))
    }

    /// Set a deadline on an existing key. Returns false when the key is absent.
    pub fn expire(&self, key: &str, ttl_secs: u64) -> VolatileResult<bool> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(e) if e.live(now) => {
                e.expires_at = Some(now + ttl_secs as i64 * 1000);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remaining TTL in seconds: None = missing key, Some(-1) = no expiry.
    pub fn ttl(&self, key: &str) -> VolatileResult<Option<i64>> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => Ok(Some(match e.expires_at {
                Some(deadline) => ((deadline - now) + 999) / 1000,
                None => -1,
            })),
            _ => Ok(None),
        }
    }

    // ---- counters ----

    pub fn incr(&self, key: &str) -> VolatileResult<i64> {
        self.incr_by(key, 1)
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> VolatileResult<i64> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Text("0".to_string()),
            expires_at: None,
        });
        if !entry.live(now) {
            *entry = Entry {
                value: Value::Text("0".to_string()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Text(s) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| VolatileError::NotInteger(key.to_string()))?;
                let next = current + delta;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(VolatileError::WrongType(key.to_string())),
        }
    }

    // ---- hash ops ----

    pub fn hset(&self, key: &str, field: &str, value: impl Into<String>) -> VolatileResult<()> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if !entry.live(now) {
            *entry = Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value.into());
                Ok(())
            }
            _ => Err(VolatileError::WrongType(key.to_string())),
        }
    }

    pub fn hget(&self, key: &str, field: &str) -> VolatileResult<Option<String>> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Hash(map) => Ok(map.get(field).cloned()),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(None),
        }
    }

    pub fn hgetall(&self, key: &str) -> VolatileResult<HashMap<String, String>> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Hash(map) => Ok(map.clone()),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(HashMap::new()),
        }
    }

    pub fn hdel(&self, key: &str, field: &str) -> VolatileResult<bool> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(e) if e.live(now) => match &mut e.value {
                Value::Hash(map) => Ok(map.remove(field).is_some()),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(false),
        }
    }

    // ---- set ops ----

    /// Add a member; returns true when it was not already present.
    pub fn sadd(&self, key: &str, member: impl Into<String>) -> VolatileResult<bool> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        if !entry.live(now) {
            *entry = Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.into())),
            _ => Err(VolatileError::WrongType(key.to_string())),
        }
    }

    pub fn srem(&self, key: &str, member: &str) -> VolatileResult<bool> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(e) if e.live(now) => match &mut e.value {
                Value::Set(set) => Ok(set.remove(member)),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(false),
        }
    }

    pub fn sismember(&self, key: &str, member: &str) -> VolatileResult<bool> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Set(set) => Ok(set.contains(member)),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(false),
        }
    }

    pub fn smembers(&self, key: &str) -> VolatileResult<Vec<String>> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(Vec::new()),
        }
    }

    pub fn scard(&self, key: &str) -> VolatileResult<u64> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Set(set) => Ok(set.len() as u64),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(0),
        }
    }

    // ---- sorted-set ops ----

    pub fn zadd(&self, key: &str, score: f64, member: impl Into<String>) -> VolatileResult<()> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Zset(HashMap::new()),
            expires_at: None,
        });
        if !entry.live(now) {
            *entry = Entry {
                value: Value::Zset(HashMap::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Zset(zset) => {
                zset.insert(member.into(), score);
                Ok(())
            }
            _ => Err(VolatileError::WrongType(key.to_string())),
        }
    }

    /// Remove members with score in the inclusive range `[min, max]`.
    pub fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> VolatileResult<u64> {
        self.guard()?;
        let now = now_millis();
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(e) if e.live(now) => match &mut e.value {
                Value::Zset(zset) => {
                    let before = zset.len();
                    zset.retain(|_, score| *score < min || *score > max);
                    Ok((before - zset.len()) as u64)
                }
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(0),
        }
    }

    pub fn zcard(&self, key: &str) -> VolatileResult<u64> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Zset(zset) => Ok(zset.len() as u64),
                _ => Err(VolatileError::WrongType(key.to_string())),
            },
            _ => Ok(0),
        }
    }

    /// Members with scores, ascending by score, for the index range
    /// `[start, stop]` (inclusive; `-1` means the last element).
    pub fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> VolatileResult<Vec<(String, f64)>> {
        self.guard()?;
        let now = now_millis();
        let entries = self.entries.read().unwrap();
        let mut items: Vec<(String, f64)> = match entries.get(key) {
            Some(e) if e.live(now) => match &e.value {
                Value::Zset(zset) => zset.iter().map(|(m, s)| (m.clone(), *s)).collect(),
                _ => return Err(VolatileError::WrongType(key.to_string())),
            },
            _ => return Ok(Vec::new()),
        };
        items.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let len = items.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(items[start as usize..=(stop as usize)].to_vec())
    }

    // ---- scanning ----

    /// Delete keys matching a glob with a single `*` wildcard.
    pub fn delete_pattern(&self, pattern: &str) -> VolatileResult<usize> {
        self.guard()?;
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        Ok(before - entries.len())
    }
}

/// Minimal glob: at most one `*`, matching any run of characters.
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}
