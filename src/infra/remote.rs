//! Networked (shared) cache tier.
//!
//! The coordinator treats this tier as the cross-process source of truth and
//! keeps a tag index on it as well, so an invalidation in one process evicts
//! entries written by another.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::lock::mutex_lock;
use crate::cache::{CacheEntry, CacheKey, DependencyIndex};

const SOURCE: &str = "infra::remote";

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("operation `{op}` timed out")]
    Timeout { op: &'static str },
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait RemoteTier: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, RemoteError>;

    /// Pipelined lookup; one slot per requested key, in order.
    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<CacheEntry>>, RemoteError> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            found.push(self.get(key).await?);
        }
        Ok(found)
    }

    /// Store an entry until its `expires_at`, indexing it under its tags.
    async fn set(&self, entry: &CacheEntry) -> Result<(), RemoteError>;

    async fn set_many(&self, entries: &[CacheEntry]) -> Result<(), RemoteError> {
        for entry in entries {
            self.set(entry).await?;
        }
        Ok(())
    }

    /// Delete entries and their tag links; returns the keys that existed.
    async fn delete_many(&self, keys: &[CacheKey]) -> Result<HashSet<CacheKey>, RemoteError>;

    async fn tag_members(&self, tag: &str) -> Result<HashSet<CacheKey>, RemoteError>;

    async fn clear_namespace(&self, namespace: &str) -> Result<usize, RemoteError>;

    async fn clear(&self) -> Result<usize, RemoteError>;

    async fn len(&self) -> Result<usize, RemoteError>;
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<CacheKey, CacheEntry>,
    index: DependencyIndex,
}

impl MemoryInner {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.index.unregister(key);
        self.entries.remove(key)
    }

    fn live(&mut self, key: &CacheKey, now: OffsetDateTime) -> Option<CacheEntry> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => return Some(entry.clone()),
            Some(_) => {}
            None => return None,
        }
        self.remove(key);
        None
    }
}

/// Shared tier held in process memory.
///
/// Suitable when a single process serves all traffic, and for tests: the
/// `set_available(false)` switch makes every call fail like an unreachable
/// server would.
#[derive(Default)]
pub struct InMemoryRemoteTier {
    inner: Mutex<MemoryInner>,
    unavailable: AtomicBool,
}

impl InMemoryRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Connection(
                "in-memory tier switched offline".to_string(),
            ));
        }
        Ok(())
    }

    fn store(inner: &mut MemoryInner, entry: &CacheEntry) {
        inner
            .index
            .register(entry.key.clone(), entry.tags.clone());
        inner.entries.insert(entry.key.clone(), entry.clone());
    }
}

#[async_trait]
impl RemoteTier for InMemoryRemoteTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, RemoteError> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        Ok(mutex_lock(&self.inner, SOURCE, "get").live(key, now))
    }

    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<CacheEntry>>, RemoteError> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        let mut inner = mutex_lock(&self.inner, SOURCE, "get_many");
        Ok(keys.iter().map(|key| inner.live(key, now)).collect())
    }

    async fn set(&self, entry: &CacheEntry) -> Result<(), RemoteError> {
        self.check()?;
        Self::store(&mut mutex_lock(&self.inner, SOURCE, "set"), entry);
        Ok(())
    }

    async fn set_many(&self, entries: &[CacheEntry]) -> Result<(), RemoteError> {
        self.check()?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "set_many");
        for entry in entries {
            Self::store(&mut inner, entry);
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[CacheKey]) -> Result<HashSet<CacheKey>, RemoteError> {
        self.check()?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "delete_many");
        Ok(keys
            .iter()
            .filter_map(|key| inner.remove(key).map(|entry| entry.key))
            .collect())
    }

    async fn tag_members(&self, tag: &str) -> Result<HashSet<CacheKey>, RemoteError> {
        self.check()?;
        Ok(mutex_lock(&self.inner, SOURCE, "tag_members")
            .index
            .keys_for_tag(tag))
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<usize, RemoteError> {
        self.check()?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear_namespace");
        let doomed: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|key| key.in_namespace(namespace))
            .cloned()
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        Ok(doomed.len())
    }

    async fn clear(&self) -> Result<usize, RemoteError> {
        self.check()?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
        let cleared = inner.entries.len();
        inner.entries.clear();
        inner.index.clear();
        Ok(cleared)
    }

    async fn len(&self) -> Result<usize, RemoteError> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        Ok(mutex_lock(&self.inner, SOURCE, "len")
            .entries
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .count())
    }
}
