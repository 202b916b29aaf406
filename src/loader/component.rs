use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cache::Tag;
use crate::optimizer::TtlScale;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Resolve as soon as requested.
    #[default]
    Immediate,
    /// Callers only request the component once it is visible; the loader
    /// adds no delay of its own.
    Viewport,
    /// Wait until no higher-priority component is loading.
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    Aggressive,
    #[default]
    Normal,
    Minimal,
}

impl CacheStrategy {
    pub const fn ttl_scale(self) -> TtlScale {
        match self {
            Self::Aggressive => TtlScale::Quadruple,
            Self::Normal => TtlScale::Unchanged,
            Self::Minimal => TtlScale::Quarter,
        }
    }
}

/// Registration of a named dashboard component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadableComponent {
    pub component_id: String,
    /// Query family resolved to produce this component's data.
    pub query_family: String,
    /// Rank; 1 loads before 2.
    pub priority: u32,
    /// Entity tags the component's data derives from. A change to any of
    /// them sends a loaded component back to `Pending`.
    pub dependencies: BTreeSet<Tag>,
    pub load_strategy: LoadStrategy,
    pub cache_strategy: CacheStrategy,
    pub preload_data: bool,
}

impl LoadableComponent {
    pub fn new(component_id: impl Into<String>, query_family: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            query_family: query_family.into(),
            priority: 100,
            dependencies: BTreeSet::new(),
            load_strategy: LoadStrategy::default(),
            cache_strategy: CacheStrategy::default(),
            preload_data: false,
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Tag>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn load_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.load_strategy = strategy;
        self
    }

    pub fn cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    pub fn preload(mut self, preload: bool) -> Self {
        self.preload_data = preload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Pending,
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadingState {
    pub status: LoadStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_loaded_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    /// Incremented by every new attempt, cancellation and re-registration.
    /// Only the current attempt may move the state forward.
    pub attempt: u64,
}

impl Default for LoadingState {
    fn default() -> Self {
        Self {
            status: LoadStatus::Pending,
            last_loaded_at: None,
            last_error: None,
            attempt: 0,
        }
    }
}

impl LoadingState {
    /// Start a new attempt in `Pending`; returns its number.
    pub(crate) fn begin(&mut self) -> u64 {
        self.attempt += 1;
        self.status = LoadStatus::Pending;
        self.attempt
    }

    pub(crate) fn mark_loading(&mut self, attempt: u64) -> bool {
        if self.attempt != attempt || self.status != LoadStatus::Pending {
            return false;
        }
        self.status = LoadStatus::Loading;
        true
    }

    pub(crate) fn complete(&mut self, attempt: u64, outcome: Result<OffsetDateTime, String>) -> bool {
        if self.attempt != attempt || self.status != LoadStatus::Loading {
            return false;
        }
        match outcome {
            Ok(loaded_at) => {
                self.status = LoadStatus::Loaded;
                self.last_loaded_at = Some(loaded_at);
                self.last_error = None;
            }
            Err(error) => {
                self.status = LoadStatus::Failed;
                self.last_error = Some(error);
            }
        }
        true
    }

    /// Back to `Pending`, superseding whatever attempt was running.
    pub(crate) fn reset(&mut self) {
        self.attempt += 1;
        self.status = LoadStatus::Pending;
    }

    /// Roll back `attempt` when its caller went away before it settled.
    pub(crate) fn abandon(&mut self, attempt: u64) -> bool {
        if self.attempt != attempt || !self.is_unsettled() {
            return false;
        }
        self.reset();
        true
    }

    /// Loaded data no longer reflects its sources. A failed component has
    /// nothing to refresh and keeps its error.
    pub(crate) fn mark_stale(&mut self) -> bool {
        if self.status == LoadStatus::Failed || self.status == LoadStatus::Pending {
            return false;
        }
        self.reset();
        true
    }

    fn is_unsettled(&self) -> bool {
        matches!(self.status, LoadStatus::Pending | LoadStatus::Loading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_current_attempt_advances() {
        let mut state = LoadingState::default();
        let first = state.begin();
        assert!(state.mark_loading(first));

        let second = state.begin();
        assert!(!state.complete(first, Ok(OffsetDateTime::UNIX_EPOCH)));
        assert!(state.mark_loading(second));
        assert!(state.complete(second, Err("boom".to_string())));
        assert_eq!(state.status, LoadStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn reset_supersedes_running_attempt() {
        let mut state = LoadingState::default();
        let attempt = state.begin();
        state.mark_loading(attempt);
        state.reset();

        assert_eq!(state.status, LoadStatus::Pending);
        assert!(!state.complete(attempt, Ok(OffsetDateTime::UNIX_EPOCH)));
        assert_eq!(state.last_loaded_at, None);
    }

    #[test]
    fn success_clears_previous_error() {
        let mut state = LoadingState::default();
        let attempt = state.begin();
        state.mark_loading(attempt);
        state.complete(attempt, Err("boom".to_string()));

        let attempt = state.begin();
        state.mark_loading(attempt);
        state.complete(attempt, Ok(OffsetDateTime::UNIX_EPOCH));
        assert_eq!(state.status, LoadStatus::Loaded);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn abandon_only_rolls_back_an_unsettled_current_attempt() {
        let mut state = LoadingState::default();
        let attempt = state.begin();
        state.mark_loading(attempt);
        assert!(state.abandon(attempt));
        assert_eq!(state.status, LoadStatus::Pending);
        assert!(!state.complete(attempt, Ok(OffsetDateTime::UNIX_EPOCH)));

        let attempt = state.begin();
        state.mark_loading(attempt);
        state.complete(attempt, Ok(OffsetDateTime::UNIX_EPOCH));
        assert!(!state.abandon(attempt));
        assert_eq!(state.status, LoadStatus::Loaded);
    }

    #[test]
    fn stale_data_returns_to_pending_but_errors_stay() {
        let mut state = LoadingState::default();
        let attempt = state.begin();
        state.mark_loading(attempt);
        state.complete(attempt, Ok(OffsetDateTime::UNIX_EPOCH));
        assert!(state.mark_stale());
        assert_eq!(state.status, LoadStatus::Pending);
        assert_eq!(state.last_loaded_at, Some(OffsetDateTime::UNIX_EPOCH));
        assert!(!state.mark_stale());

        let attempt = state.begin();
        state.mark_loading(attempt);
        state.complete(attempt, Err("boom".to_string()));
        assert!(!state.mark_stale());
        assert_eq!(state.status, LoadStatus::Failed);
    }

    #[test]
    fn cache_strategy_maps_to_ttl_scale() {
        assert_eq!(CacheStrategy::Aggressive.ttl_scale(), TtlScale::Quadruple);
        assert_eq!(CacheStrategy::Minimal.ttl_scale(), TtlScale::Quarter);
    }

    #[test]
    fn builder_sets_fields() {
        let component = LoadableComponent::new("spend_chart", "spend_analytics")
            .priority(1)
            .dependencies(["purchase_orders", "vendors"])
            .load_strategy(LoadStrategy::Idle)
            .cache_strategy(CacheStrategy::Aggressive)
            .preload(true);
        assert_eq!(component.priority, 1);
        assert_eq!(component.dependencies.len(), 2);
        assert!(component.preload_data);
    }
}
