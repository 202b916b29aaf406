//! Bidirectional dependency index.
//!
//! Tracks the relationship between dependency tags and cache entries so a
//! change to one class of data can evict every derived entry in one call.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::keys::{CacheKey, Tag};

/// Tracks tag → cache_keys and cache_key → tags mappings.
///
/// The index is not synchronised on its own; owners keep it behind the same
/// lock as the entries it describes so both change together.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    /// Maps tags to all cache keys that depend on them
    tag_to_keys: HashMap<Tag, HashSet<CacheKey>>,
    /// Maps cache keys to all tags they depend on
    key_to_tags: HashMap<CacheKey, BTreeSet<Tag>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache entry with its dependency tags.
    ///
    /// An existing registration for the same key is replaced, so a key never
    /// stays linked to a tag its current entry no longer carries.
    pub fn register(&mut self, cache_key: CacheKey, tags: BTreeSet<Tag>) {
        self.unregister(&cache_key);

        if tags.is_empty() {
            return;
        }

        for tag in &tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(cache_key.clone());
        }
        self.key_to_tags.insert(cache_key, tags);
    }

    /// Remove a cache key from every tag it carried.
    ///
    /// Returns the tags the key was registered under, if any.
    pub fn unregister(&mut self, cache_key: &CacheKey) -> Option<BTreeSet<Tag>> {
        let tags = self.key_to_tags.remove(cache_key)?;
        for tag in &tags {
            if let Some(keys) = self.tag_to_keys.get_mut(tag) {
                keys.remove(cache_key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(tag);
                }
            }
        }
        Some(tags)
    }

    /// Get all cache keys tagged with `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<CacheKey> {
        self.tag_to_keys.get(tag).cloned().unwrap_or_default()
    }

    /// Get all tags a cache key depends on.
    pub fn tags_for_key(&self, cache_key: &CacheKey) -> BTreeSet<Tag> {
        self.key_to_tags.get(cache_key).cloned().unwrap_or_default()
    }

    /// Every key currently registered.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.key_to_tags.keys()
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }

    /// Both directions of the index point at each other.
    pub fn is_consistent(&self) -> bool {
        let forward = self.tag_to_keys.iter().all(|(tag, keys)| {
            !keys.is_empty()
                && keys.iter().all(|key| {
                    self.key_to_tags
                        .get(key)
                        .is_some_and(|tags| tags.contains(tag))
                })
        });
        let backward = self.key_to_tags.iter().all(|(key, tags)| {
            tags.iter().all(|tag| {
                self.tag_to_keys
                    .get(tag)
                    .is_some_and(|keys| keys.contains(key))
            })
        });
        forward && backward
    }
}
