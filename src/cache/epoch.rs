//! Invalidation epochs.
//!
//! Every tag invalidation and every clear advances a global counter. A writer
//! that captured the counter before it started deriving a result can ask
//! whether any of the result's tags were invalidated since, and drop the
//! write instead of caching data that is already stale.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::keys::Tag;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::epoch";

#[derive(Debug, Default)]
pub(crate) struct InvalidationLog {
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    epoch: u64,
    /// Epoch of the latest invalidation per tag.
    tags: HashMap<Tag, u64>,
    /// Epoch of the latest clear, which counts against every tag.
    cleared: u64,
}

impl InvalidationLog {
    pub fn current(&self) -> u64 {
        mutex_lock(&self.state, SOURCE, "current").epoch
    }

    pub fn record_tag(&self, tag: &str) -> u64 {
        let mut state = mutex_lock(&self.state, SOURCE, "record_tag");
        state.epoch += 1;
        let epoch = state.epoch;
        state.tags.insert(tag.to_string(), epoch);
        epoch
    }

    pub fn record_clear(&self) -> u64 {
        let mut state = mutex_lock(&self.state, SOURCE, "record_clear");
        state.epoch += 1;
        state.cleared = state.epoch;
        state.cleared
    }

    pub fn touched_since(&self, tags: &BTreeSet<Tag>, since: u64) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "touched_since");
        state.cleared > since
            || tags
                .iter()
                .any(|tag| state.tags.get(tag).is_some_and(|&at| at > since))
    }
}
