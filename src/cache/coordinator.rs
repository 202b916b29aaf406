//! Two-tier cache coordinator.
//!
//! Reads check the process-local tier first and fall back to the networked
//! tier, populating the local tier on a remote hit. Writes go to both tiers.
//! When the networked tier fails the coordinator keeps serving from the local
//! tier: a write that only reached the local tier still reports success
//! (`SetOutcome::LocalOnly`) but is invisible to other processes.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::infra::{RemoteError, RemoteTier};

use super::codec;
use super::config::CacheConfig;
use super::epoch::InvalidationLog;
use super::error::CacheError;
use super::keys::{CacheKey, Tag};
use super::stats::{CacheStatistics, StatsRecorder, TierSizes};
use super::store::{CacheEntry, LocalPut, LocalTier};

const METRIC_LOCAL_HIT: &str = "fathom_cache_local_hit_total";
const METRIC_REMOTE_HIT: &str = "fathom_cache_remote_hit_total";
const METRIC_MISS: &str = "fathom_cache_miss_total";
const METRIC_EVICT: &str = "fathom_cache_evict_total";
const METRIC_REMOTE_ERROR: &str = "fathom_cache_remote_error_total";
const METRIC_INVALIDATED: &str = "fathom_cache_invalidated_total";

/// Options for a single write.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Falls back to the configured default TTL.
    pub ttl: Option<Duration>,
    pub tags: BTreeSet<Tag>,
    pub compress: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Tag>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Where a successful write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Written to both tiers.
    Stored,
    /// Written locally only; other processes will not see it.
    LocalOnly,
}

pub struct CacheCoordinator {
    config: CacheConfig,
    local: LocalTier,
    remote: Option<Arc<dyn RemoteTier>>,
    stats: StatsRecorder,
    invalidations: InvalidationLog,
}

impl CacheCoordinator {
    /// Create a coordinator. The networked tier is ignored when
    /// `config.enable_remote` is off.
    pub fn new(config: CacheConfig, remote: Option<Arc<dyn RemoteTier>>) -> Self {
        let remote = remote.filter(|_| config.enable_remote);
        info!(
            local_capacity = config.local_capacity,
            remote = remote.is_some(),
            "cache coordinator initialised"
        );
        Self {
            local: LocalTier::new(config.local_capacity_non_zero()),
            config,
            remote,
            stats: StatsRecorder::default(),
            invalidations: InvalidationLog::default(),
        }
    }

    /// Coordinator with no networked tier.
    pub fn local_only(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key in the configured default namespace.
    pub fn key(&self, key: impl Into<String>) -> CacheKey {
        CacheKey::new(self.config.default_namespace.clone(), key)
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Read a value. Misses, expired entries and undecodable payloads all
    /// read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let entry = self.get_entry(key).await?;
        self.decode_entry(&entry)
    }

    /// Like [`get`](Self::get), but an undecodable entry is reported instead
    /// of reading as a miss. The entry is dropped either way.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let Some(entry) = self.get_entry(key).await else {
            return Ok(None);
        };
        codec::decode(&entry.payload, entry.compressed)
            .map(Some)
            .inspect_err(|err| {
                warn!(key = %entry.key, error = %err, "dropping undecodable cache entry");
                self.local.remove(&entry.key);
            })
    }

    /// Read the raw entry, with read-through from the networked tier.
    pub async fn get_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();

        if let Some(entry) = self.local.get(key, now) {
            self.stats.local_hit(started.elapsed());
            counter!(METRIC_LOCAL_HIT).increment(1);
            debug!(cache = "local", outcome = "hit", %key, "cache lookup");
            return Some(entry);
        }

        if let Some(remote) = &self.remote {
            match remote.get(key).await {
                Ok(Some(entry)) if !entry.is_expired_at(now) => {
                    self.store_local(entry.clone());
                    self.stats.remote_hit(started.elapsed());
                    counter!(METRIC_REMOTE_HIT).increment(1);
                    debug!(cache = "remote", outcome = "hit", %key, "cache lookup");
                    return Some(entry);
                }
                Ok(_) => {}
                Err(err) => self.remote_failed("get", &err),
            }
        }

        self.stats.miss(started.elapsed());
        counter!(METRIC_MISS).increment(1);
        debug!(outcome = "miss", %key, "cache lookup");
        None
    }

    /// Write a value to both tiers and index it under `options.tags`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        options: SetOptions,
    ) -> Result<SetOutcome, CacheError> {
        let entry = self.build_entry(key, value, options)?;
        self.store_local(entry.clone());
        self.stats.set();

        let Some(remote) = &self.remote else {
            return Ok(SetOutcome::LocalOnly);
        };
        match remote.set(&entry).await {
            Ok(()) => Ok(SetOutcome::Stored),
            Err(err) => {
                self.remote_failed("set", &err);
                Ok(SetOutcome::LocalOnly)
            }
        }
    }

    /// Remove a single key from both tiers. Returns true if it existed.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        let mut existed = self.local.remove(key).is_some();
        if let Some(remote) = &self.remote {
            match remote.delete_many(std::slice::from_ref(key)).await {
                Ok(removed) => existed |= !removed.is_empty(),
                Err(err) => self.remote_failed("delete", &err),
            }
        }
        existed
    }

    /// Evict every entry tagged with `tag` from both tiers, unlinking each one
    /// from all of its tags. Returns the number of entries removed.
    #[instrument(skip(self))]
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        self.invalidations.record_tag(tag);
        let mut keys: BTreeSet<CacheKey> = self.local.keys_for_tag(tag).into_iter().collect();

        if let Some(remote) = &self.remote {
            match remote.tag_members(tag).await {
                Ok(members) => keys.extend(members),
                Err(err) => self.remote_failed("tag_members", &err),
            }
        }

        if keys.is_empty() {
            debug!(removed = 0, "nothing tagged");
            return 0;
        }

        let mut removed = self.local.remove_many(&keys);
        if let Some(remote) = &self.remote {
            let keys: Vec<CacheKey> = keys.iter().cloned().collect();
            match remote.delete_many(&keys).await {
                Ok(remote_removed) => removed.extend(remote_removed),
                Err(err) => self.remote_failed("delete_many", &err),
            }
        }

        let count = removed.len();
        self.stats.invalidated(count);
        counter!(METRIC_INVALIDATED).increment(count as u64);
        info!(removed = count, "invalidated entries by tag");
        count
    }

    /// Elementwise `get` with a single networked-tier round trip for all
    /// local misses.
    pub async fn batch_get<T: DeserializeOwned>(&self, keys: &[CacheKey]) -> Vec<Option<T>> {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();
        let mut found: Vec<Option<CacheEntry>> =
            keys.iter().map(|key| self.local.get(key, now)).collect();

        let missing: Vec<usize> = found
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| entry.is_none().then_some(position))
            .collect();
        let local_hits = keys.len() - missing.len();

        let mut remote_hits = 0;
        if let (Some(remote), false) = (&self.remote, missing.is_empty()) {
            let wanted: Vec<CacheKey> = missing.iter().map(|&i| keys[i].clone()).collect();
            match remote.get_many(&wanted).await {
                Ok(entries) => {
                    for (&position, entry) in missing.iter().zip(entries) {
                        if let Some(entry) = entry.filter(|entry| !entry.is_expired_at(now)) {
                            self.store_local(entry.clone());
                            found[position] = Some(entry);
                            remote_hits += 1;
                        }
                    }
                }
                Err(err) => self.remote_failed("get_many", &err),
            }
        }

        let per_key = started.elapsed() / keys.len().max(1) as u32;
        for _ in 0..local_hits {
            self.stats.local_hit(per_key);
        }
        for _ in 0..remote_hits {
            self.stats.remote_hit(per_key);
        }
        let misses = missing.len() - remote_hits;
        for _ in 0..misses {
            self.stats.miss(per_key);
        }
        counter!(METRIC_LOCAL_HIT).increment(local_hits as u64);
        counter!(METRIC_REMOTE_HIT).increment(remote_hits as u64);
        counter!(METRIC_MISS).increment(misses as u64);

        found
            .into_iter()
            .map(|entry| entry.and_then(|entry| self.decode_entry(&entry)))
            .collect()
    }

    /// Elementwise `set`, pipelined to the networked tier. There is no
    /// atomicity across the batch: each slot reports its own outcome.
    pub async fn batch_set<T: Serialize>(
        &self,
        entries: Vec<(CacheKey, T, SetOptions)>,
    ) -> Vec<Result<SetOutcome, CacheError>> {
        let mut outcomes = Vec::with_capacity(entries.len());
        let mut pending = Vec::new();
        let mut pending_slots = Vec::new();

        for (key, value, options) in entries {
            match self.build_entry(&key, &value, options) {
                Ok(entry) => {
                    self.store_local(entry.clone());
                    self.stats.set();
                    pending_slots.push(outcomes.len());
                    pending.push(entry);
                    outcomes.push(Ok(SetOutcome::LocalOnly));
                }
                Err(err) => outcomes.push(Err(err)),
            }
        }

        if let (Some(remote), false) = (&self.remote, pending.is_empty()) {
            match remote.set_many(&pending).await {
                Ok(()) => {
                    for slot in pending_slots {
                        outcomes[slot] = Ok(SetOutcome::Stored);
                    }
                }
                Err(err) => self.remote_failed("set_many", &err),
            }
        }

        outcomes
    }

    pub async fn get_statistics(&self) -> CacheStatistics {
        let remote = match &self.remote {
            Some(remote) => match remote.len().await {
                Ok(len) => Some(len),
                Err(err) => {
                    self.remote_failed("len", &err);
                    None
                }
            },
            None => None,
        };
        self.stats.snapshot(TierSizes {
            local: self.local.len(),
            local_bytes: self.local.size_bytes(),
            remote,
        })
    }

    /// Zero the counters. Cached entries are kept.
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Drop expired local entries. The networked tier expires on its own.
    pub fn purge_expired(&self) -> usize {
        let purged = self.local.purge_expired(OffsetDateTime::now_utc());
        if purged > 0 {
            debug!(purged, "purged expired local entries");
        }
        purged
    }

    pub async fn clear_namespace(&self, namespace: &str) -> usize {
        self.invalidations.record_clear();
        let mut cleared = self.local.clear_namespace(namespace);
        if let Some(remote) = &self.remote {
            match remote.clear_namespace(namespace).await {
                Ok(count) => cleared = cleared.max(count),
                Err(err) => self.remote_failed("clear_namespace", &err),
            }
        }
        info!(namespace, cleared, "cleared cache namespace");
        cleared
    }

    /// Evict everything from both tiers.
    pub async fn clear(&self) {
        self.invalidations.record_clear();
        self.local.clear();
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.clear().await {
                self.remote_failed("clear", &err);
            }
        }
        info!("cleared cache");
    }

    /// Counter advanced by every tag invalidation and clear.
    pub fn invalidation_epoch(&self) -> u64 {
        self.invalidations.current()
    }

    /// Whether any of `tags` was invalidated, or the cache cleared, after
    /// `epoch` was read from [`Self::invalidation_epoch`].
    pub fn invalidated_since(&self, tags: &BTreeSet<Tag>, epoch: u64) -> bool {
        self.invalidations.touched_since(tags, epoch)
    }

    /// Keys the local dependency index holds for `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<CacheKey> {
        self.local.keys_for_tag(tag)
    }

    /// Tags the local dependency index holds for `key`.
    pub fn tags_for_key(&self, key: &CacheKey) -> BTreeSet<Tag> {
        self.local.tags_for_key(key)
    }

    /// Every locally indexed key has a live entry and the index agrees with
    /// itself in both directions.
    pub fn index_is_consistent(&self) -> bool {
        self.local.index_is_consistent()
    }

    fn build_entry<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        options: SetOptions,
    ) -> Result<CacheEntry, CacheError> {
        let encoded = codec::encode(
            value,
            options.compress,
            self.config.compression_threshold_bytes,
        )?;
        Ok(CacheEntry::new(
            key.clone(),
            encoded.payload,
            encoded.compressed,
            options.tags,
            options.ttl.unwrap_or_else(|| self.config.default_ttl()),
            OffsetDateTime::now_utc(),
        ))
    }

    fn store_local(&self, entry: CacheEntry) {
        if let LocalPut::Evicted(evicted) = self.local.put(entry) {
            counter!(METRIC_EVICT).increment(1);
            debug!(%evicted, "local tier evicted entry");
        }
    }

    fn decode_entry<T: DeserializeOwned>(&self, entry: &CacheEntry) -> Option<T> {
        match codec::decode(&entry.payload, entry.compressed) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %entry.key, error = %err, "dropping undecodable cache entry");
                self.local.remove(&entry.key);
                None
            }
        }
    }

    fn remote_failed(&self, op: &'static str, err: &RemoteError) {
        self.stats.remote_error();
        counter!(METRIC_REMOTE_ERROR, "op" => op).increment(1);
        warn!(
            op,
            error = %err,
            degraded = "local_only",
            "networked cache tier unavailable"
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::infra::InMemoryRemoteTier;

    fn coordinator() -> (CacheCoordinator, Arc<InMemoryRemoteTier>) {
        let remote = Arc::new(InMemoryRemoteTier::new());
        let cache = CacheCoordinator::new(
            CacheConfig::default(),
            Some(remote.clone() as Arc<dyn RemoteTier>),
        );
        (cache, remote)
    }

    #[tokio::test]
    async fn set_then_get_from_local_tier() {
        let (cache, _) = coordinator();
        let key = cache.key("spend");

        let outcome = cache
            .set(&key, &json!({"total": 10}), SetOptions::new().tags(["vendors"]))
            .await
            .expect("set");

        assert_eq!(outcome, SetOutcome::Stored);
        assert_eq!(cache.get::<Value>(&key).await, Some(json!({"total": 10})));
        assert_eq!(cache.get_statistics().await.local_hits, 1);
    }

    #[tokio::test]
    async fn remote_hit_populates_local_tier() {
        let remote = Arc::new(InMemoryRemoteTier::new());
        let writer = CacheCoordinator::new(
            CacheConfig::default(),
            Some(remote.clone() as Arc<dyn RemoteTier>),
        );
        let reader = CacheCoordinator::new(
            CacheConfig::default(),
            Some(remote.clone() as Arc<dyn RemoteTier>),
        );
        let key = writer.key("shared");
        writer
            .set(&key, &7_u32, SetOptions::new().tags(["vessels"]))
            .await
            .expect("set");

        assert_eq!(reader.get::<u32>(&key).await, Some(7));
        assert_eq!(reader.get::<u32>(&key).await, Some(7));

        let stats = reader.get_statistics().await;
        assert_eq!(stats.remote_hits, 1);
        assert_eq!(stats.local_hits, 1);
        assert!(reader.keys_for_tag("vessels").contains(&key));
    }

    #[tokio::test]
    async fn invalidation_reaches_entries_written_by_another_process() {
        let remote = Arc::new(InMemoryRemoteTier::new());
        let writer = CacheCoordinator::new(
            CacheConfig::default(),
            Some(remote.clone() as Arc<dyn RemoteTier>),
        );
        let invalidator = CacheCoordinator::new(
            CacheConfig::default(),
            Some(remote.clone() as Arc<dyn RemoteTier>),
        );
        let key = writer.key("spend");
        writer
            .set(&key, &1_u8, SetOptions::new().tags(["purchase_orders"]))
            .await
            .expect("set");

        assert_eq!(invalidator.invalidate_by_tag("purchase_orders").await, 1);
        assert!(remote.get(&key).await.expect("remote get").is_none());
    }

    #[tokio::test]
    async fn invalidate_unlinks_every_tag_of_removed_entries() {
        let (cache, _) = coordinator();
        let key = cache.key("spend");
        cache
            .set(
                &key,
                &1_u8,
                SetOptions::new().tags(["purchase_orders", "vendors", "vessels"]),
            )
            .await
            .expect("set");

        assert_eq!(cache.invalidate_by_tag("vendors").await, 1);
        assert!(cache.get::<u8>(&key).await.is_none());
        for tag in ["purchase_orders", "vendors", "vessels"] {
            assert!(cache.keys_for_tag(tag).is_empty(), "{tag} still indexed");
        }
        assert!(cache.index_is_consistent());
    }

    #[tokio::test]
    async fn unavailable_remote_degrades_to_local_only() {
        let (cache, remote) = coordinator();
        remote.set_available(false);
        let key = cache.key("spend");

        let outcome = cache
            .set(&key, &json!([1, 2, 3]), SetOptions::new())
            .await
            .expect("local write still succeeds");
        assert_eq!(outcome, SetOutcome::LocalOnly);
        assert_eq!(cache.get::<Value>(&key).await, Some(json!([1, 2, 3])));

        let stats = cache.get_statistics().await;
        assert!(stats.remote_errors >= 1);
        assert_eq!(stats.tier_sizes.remote, None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let (cache, _) = coordinator();
        let key = cache.key("short");
        cache
            .set(&key, &1_u8, SetOptions::new().ttl(Duration::from_millis(20)))
            .await
            .expect("set");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get::<u8>(&key).await.is_none());
    }

    #[tokio::test]
    async fn compressed_values_decode_transparently() {
        let (cache, remote) = coordinator();
        let key = cache.key("big");
        let rows: Vec<Value> = (0..300).map(|i| json!({"row": i, "vendor": "acme"})).collect();
        let value = json!({ "rows": rows });

        cache
            .set(&key, &value, SetOptions::new().compress(true))
            .await
            .expect("set");

        let stored = remote.get(&key).await.expect("remote").expect("entry");
        assert!(stored.compressed);
        assert_eq!(cache.get::<Value>(&key).await, Some(value));
    }

    #[tokio::test]
    async fn batch_get_mixes_tiers_and_misses() {
        let (cache, remote) = coordinator();
        let local = cache.key("local");
        let shared = cache.key("shared");
        let missing = cache.key("missing");

        cache.set(&local, &1_u32, SetOptions::new()).await.expect("set");
        let entry = CacheEntry::new(
            shared.clone(),
            b"2".to_vec(),
            false,
            BTreeSet::new(),
            Duration::from_secs(60),
            OffsetDateTime::now_utc(),
        );
        remote.set(&entry).await.expect("remote set");

        let values = cache
            .batch_get::<u32>(&[local, shared, missing])
            .await;
        assert_eq!(values, vec![Some(1), Some(2), None]);

        let stats = cache.get_statistics().await;
        assert_eq!((stats.local_hits, stats.remote_hits, stats.misses), (1, 1, 1));
    }

    #[tokio::test]
    async fn batch_set_reports_per_slot_outcomes() {
        let (cache, remote) = coordinator();
        let outcomes = cache
            .batch_set(vec![
                (cache.key("a"), 1_u32, SetOptions::new().tags(["vendors"])),
                (cache.key("b"), 2_u32, SetOptions::new().tags(["vendors"])),
            ])
            .await;
        assert!(outcomes.iter().all(|outcome| matches!(outcome, Ok(SetOutcome::Stored))));
        assert_eq!(cache.keys_for_tag("vendors").len(), 2);

        remote.set_available(false);
        let outcomes = cache
            .batch_set(vec![(cache.key("c"), 3_u32, SetOptions::new())])
            .await;
        assert!(matches!(outcomes[0], Ok(SetOutcome::LocalOnly)));
    }

    #[tokio::test]
    async fn reset_statistics_keeps_entries() {
        let (cache, _) = coordinator();
        let key = cache.key("kept");
        cache.set(&key, &1_u8, SetOptions::new()).await.expect("set");
        let _ = cache.get::<u8>(&key).await;

        cache.reset_statistics();
        let stats = cache.get_statistics().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.tier_sizes.local, 1);
        assert_eq!(cache.get::<u8>(&key).await, Some(1));
    }

    #[tokio::test]
    async fn empty_tag_invalidation_is_a_no_op() {
        let (cache, _) = coordinator();
        assert_eq!(cache.invalidate_by_tag("nothing").await, 0);
    }

    #[tokio::test]
    async fn clear_namespace_spans_both_tiers() {
        let (cache, remote) = coordinator();
        cache
            .set(&CacheKey::new("query", "a"), &1_u8, SetOptions::new())
            .await
            .expect("set");
        cache
            .set(&CacheKey::new("session", "a"), &1_u8, SetOptions::new())
            .await
            .expect("set");

        assert_eq!(cache.clear_namespace("query").await, 1);
        assert_eq!(remote.len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn invalidations_advance_the_epoch_even_when_nothing_is_tagged() {
        let (cache, remote) = coordinator();
        let since = cache.invalidation_epoch();
        let tags: BTreeSet<Tag> = ["vendors".to_string()].into();

        remote.set_available(false);
        assert_eq!(cache.invalidate_by_tag("vessels").await, 0);
        assert!(!cache.invalidated_since(&tags, since));

        assert_eq!(cache.invalidate_by_tag("vendors").await, 0);
        assert!(cache.invalidated_since(&tags, since));
        assert!(!cache.invalidated_since(&tags, cache.invalidation_epoch()));
    }
}
