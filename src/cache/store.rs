//! Process-local cache tier.
//!
//! Entries live in an LRU map bounded by entry count. The dependency index is
//! kept behind the same lock as the entries so a write, an eviction or an
//! invalidation updates both in one critical section.

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::keys::{CacheKey, Tag};
use super::lock::mutex_lock;
use super::registry::DependencyIndex;

const SOURCE: &str = "cache::store";

/// Upper bound for any TTL; longer requests are clamped.
const MAX_TTL: time::Duration = time::Duration::days(3650);

/// A stored value. Immutable once written; updates replace the whole entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Serialized value, gzip-compressed when `compressed` is set.
    pub payload: Vec<u8>,
    pub compressed: bool,
    pub tags: BTreeSet<Tag>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        payload: Vec<u8>,
        compressed: bool,
        tags: BTreeSet<Tag>,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Self {
        let size_bytes = payload.len();
        Self {
            key,
            payload,
            compressed,
            tags,
            created_at: now,
            expires_at: expiry_from(now, ttl),
            size_bytes,
        }
    }

    /// An entry is logically absent once its expiry has passed.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, or `None` when already expired.
    pub fn remaining_ttl(&self, now: OffsetDateTime) -> Option<Duration> {
        if self.is_expired_at(now) {
            return None;
        }
        Duration::try_from(self.expires_at - now).ok()
    }
}

pub(crate) fn expiry_from(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    let ttl = time::Duration::try_from(ttl)
        .unwrap_or(MAX_TTL)
        .min(MAX_TTL);
    now + ttl
}

struct LocalInner {
    entries: LruCache<CacheKey, CacheEntry>,
    index: DependencyIndex,
}

impl LocalInner {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.index.unregister(key);
        self.entries.pop(key)
    }
}

/// Outcome of inserting into the local tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalPut {
    Inserted,
    Replaced,
    /// The write pushed the least-recently-used entry out.
    Evicted(CacheKey),
}

/// Fast process-local tier.
pub struct LocalTier {
    inner: Mutex<LocalInner>,
}

impl LocalTier {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LocalInner {
                entries: LruCache::new(capacity),
                index: DependencyIndex::new(),
            }),
        }
    }

    /// Look up a live entry. Expired entries are dropped on the way out.
    pub fn get(&self, key: &CacheKey, now: OffsetDateTime) -> Option<CacheEntry> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "get");
        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => return Some(entry.clone()),
            Some(_) => {}
            None => return None,
        }
        inner.remove(key);
        None
    }

    pub fn put(&self, entry: CacheEntry) -> LocalPut {
        let mut inner = mutex_lock(&self.inner, SOURCE, "put");
        let key = entry.key.clone();
        inner.index.register(key.clone(), entry.tags.clone());

        match inner.entries.push(key.clone(), entry) {
            None => LocalPut::Inserted,
            Some((previous, _)) if previous == key => LocalPut::Replaced,
            Some((evicted, _)) => {
                inner.index.unregister(&evicted);
                LocalPut::Evicted(evicted)
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        mutex_lock(&self.inner, SOURCE, "remove").remove(key)
    }

    /// Remove every listed key; returns the keys that were present.
    pub fn remove_many<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a CacheKey>,
    ) -> HashSet<CacheKey> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "remove_many");
        keys.into_iter()
            .filter_map(|key| inner.remove(key).map(|entry| entry.key))
            .collect()
    }

    pub fn keys_for_tag(&self, tag: &str) -> HashSet<CacheKey> {
        mutex_lock(&self.inner, SOURCE, "keys_for_tag").index.keys_for_tag(tag)
    }

    pub fn tags_for_key(&self, key: &CacheKey) -> BTreeSet<Tag> {
        mutex_lock(&self.inner, SOURCE, "tags_for_key").index.tags_for_key(key)
    }

    /// Drop every expired entry together with its index links.
    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let mut inner = mutex_lock(&self.inner, SOURCE, "purge_expired");
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn clear_namespace(&self, namespace: &str) -> usize {
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear_namespace");
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.in_namespace(namespace))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
        inner.entries.clear();
        inner.index.clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes held locally.
    pub fn size_bytes(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "size_bytes")
            .entries
            .iter()
            .map(|(_, entry)| entry.size_bytes)
            .sum()
    }

    pub(crate) fn index_is_consistent(&self) -> bool {
        let inner = mutex_lock(&self.inner, SOURCE, "index_is_consistent");
        inner.index.is_consistent()
            && inner.index.keys().all(|key| inner.entries.contains(key))
    }
}
