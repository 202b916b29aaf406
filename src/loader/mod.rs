//! Priority-ordered loading of dashboard components.

mod component;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::cache::lock::{rw_read, rw_write};
use crate::error::EngineError;
use crate::optimizer::{QueryOptimizer, ResolutionMetrics, ResolveOptions};

pub use component::{
    CacheStrategy, LoadStatus, LoadStrategy, LoadableComponent, LoadingState,
};

const SOURCE: &str = "loader";

/// One entry of a batch load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub component_id: String,
    pub filters: Value,
}

impl LoadRequest {
    pub fn new(component_id: impl Into<String>, filters: Value) -> Self {
        Self {
            component_id: component_id.into(),
            filters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedComponent {
    pub component_id: String,
    pub data: Value,
    pub metrics: ResolutionMetrics,
    /// False when the attempt was cancelled or superseded while running; the
    /// data is still valid but did not update the loading state.
    pub authoritative: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadingStatistics {
    pub total: usize,
    pub pending: usize,
    pub loading: usize,
    pub loaded: usize,
    pub failed: usize,
}

struct Registered {
    component: LoadableComponent,
    state: LoadingState,
}

pub struct ComponentLoader {
    optimizer: Arc<QueryOptimizer>,
    components: RwLock<HashMap<String, Registered>>,
    settled: Notify,
}

impl ComponentLoader {
    pub fn new(optimizer: Arc<QueryOptimizer>) -> Self {
        Self {
            optimizer,
            components: RwLock::new(HashMap::new()),
            settled: Notify::new(),
        }
    }

    /// Insert or replace a registration and reset its state to `Pending`.
    /// A load still running for the old registration stops being
    /// authoritative.
    pub fn register_component(&self, component: LoadableComponent) {
        let mut components = rw_write(&self.components, SOURCE, "register_component");
        let id = component.component_id.clone();
        match components.get_mut(&id) {
            Some(existing) => {
                existing.component = component;
                existing.state.reset();
            }
            None => {
                components.insert(
                    id.clone(),
                    Registered {
                        component,
                        state: LoadingState::default(),
                    },
                );
            }
        }
        drop(components);
        debug!(component_id = %id, "component registered");
        self.settled.notify_waiters();
    }

    pub fn component(&self, component_id: &str) -> Option<LoadableComponent> {
        rw_read(&self.components, SOURCE, "component")
            .get(component_id)
            .map(|registered| registered.component.clone())
    }

    /// Registered components in priority order.
    pub fn components(&self) -> Vec<LoadableComponent> {
        let mut components: Vec<LoadableComponent> = rw_read(&self.components, SOURCE, "components")
            .values()
            .map(|registered| registered.component.clone())
            .collect();
        components.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.component_id.cmp(&b.component_id))
        });
        components
    }

    pub fn loading_state(&self, component_id: &str) -> Option<LoadingState> {
        rw_read(&self.components, SOURCE, "loading_state")
            .get(component_id)
            .map(|registered| registered.state.clone())
    }

    #[instrument(skip(self, filters))]
    pub async fn load_component(
        &self,
        component_id: &str,
        filters: &Value,
    ) -> Result<LoadedComponent, EngineError> {
        let (component, attempt) = {
            let mut components = rw_write(&self.components, SOURCE, "load_component");
            let registered = components
                .get_mut(component_id)
                .ok_or_else(|| EngineError::not_registered(component_id))?;
            let attempt = registered.state.begin();
            if registered.component.load_strategy != LoadStrategy::Idle {
                registered.state.mark_loading(attempt);
            }
            (registered.component.clone(), attempt)
        };
        let _abandon = AbandonOnDrop {
            loader: self,
            component_id,
            attempt,
        };

        match component.load_strategy {
            LoadStrategy::Immediate => {}
            LoadStrategy::Viewport => debug!("viewport component requested; caller owns deferral"),
            LoadStrategy::Idle => {
                self.wait_for_idle(component.priority).await;
                let mut components = rw_write(&self.components, SOURCE, "load_component");
                if let Some(registered) = components.get_mut(component_id) {
                    registered.state.mark_loading(attempt);
                }
            }
        }

        let ttl = self
            .optimizer
            .cache_ttl_for(&component.query_family, component.cache_strategy.ttl_scale());
        let outcome = self
            .optimizer
            .resolve_with(
                &component.query_family,
                filters,
                ResolveOptions::default().cache_ttl(ttl),
            )
            .await;

        let completion = match &outcome {
            Ok(_) => Ok(OffsetDateTime::now_utc()),
            Err(err) => Err(err.to_string()),
        };
        let authoritative = rw_write(&self.components, SOURCE, "load_component")
            .get_mut(component_id)
            .is_some_and(|registered| registered.state.complete(attempt, completion));
        self.settled.notify_waiters();

        if !authoritative {
            debug!(attempt, "load finished after being cancelled or superseded");
        }

        outcome.map(|resolution| LoadedComponent {
            component_id: component.component_id,
            data: resolution.data,
            metrics: resolution.metrics,
            authoritative,
        })
    }

    /// Load sequentially in priority order (1 before 2); call order breaks
    /// ties. A failed component does not stop the batch.
    pub async fn batch_load_components(
        &self,
        requests: Vec<LoadRequest>,
    ) -> BTreeMap<String, Result<LoadedComponent, EngineError>> {
        let mut ordered: Vec<(u32, LoadRequest)> = {
            let components = rw_read(&self.components, SOURCE, "batch_load_components");
            requests
                .into_iter()
                .map(|request| {
                    let priority = components
                        .get(&request.component_id)
                        .map_or(u32::MAX, |registered| registered.component.priority);
                    (priority, request)
                })
                .collect()
        };
        ordered.sort_by_key(|(priority, _)| *priority);

        let mut results = BTreeMap::new();
        for (_, request) in ordered {
            let result = self
                .load_component(&request.component_id, &request.filters)
                .await;
            results.insert(request.component_id, result);
        }
        results
    }

    /// Components depending on `tag` whose data is loaded or still loading go
    /// back to `Pending`; a running attempt stops being authoritative.
    /// Returns their ids in priority order.
    pub fn mark_stale(&self, tag: &str) -> Vec<String> {
        let mut stale: Vec<(u32, String)> = rw_write(&self.components, SOURCE, "mark_stale")
            .values_mut()
            .filter(|registered| registered.component.dependencies.contains(tag))
            .filter_map(|registered| {
                registered.state.mark_stale().then(|| {
                    (
                        registered.component.priority,
                        registered.component.component_id.clone(),
                    )
                })
            })
            .collect();
        if stale.is_empty() {
            return Vec::new();
        }
        stale.sort();
        debug!(tag, count = stale.len(), "components marked stale");
        self.settled.notify_waiters();
        stale.into_iter().map(|(_, id)| id).collect()
    }

    /// Advisory: a `Loading` component goes back to `Pending` and its
    /// running attempt stops being authoritative. The computation itself is
    /// not stopped.
    pub fn cancel_loading(&self, component_id: &str) -> bool {
        let cancelled = {
            let mut components = rw_write(&self.components, SOURCE, "cancel_loading");
            match components.get_mut(component_id) {
                Some(registered) if registered.state.status == LoadStatus::Loading => {
                    registered.state.reset();
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            info!(component_id, "component load cancelled");
            self.settled.notify_waiters();
        }
        cancelled
    }

    pub fn get_loading_statistics(&self) -> LoadingStatistics {
        let components = rw_read(&self.components, SOURCE, "get_loading_statistics");
        let mut stats = LoadingStatistics {
            total: components.len(),
            ..LoadingStatistics::default()
        };
        for registered in components.values() {
            match registered.state.status {
                LoadStatus::Pending => stats.pending += 1,
                LoadStatus::Loading => stats.loading += 1,
                LoadStatus::Loaded => stats.loaded += 1,
                LoadStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Load every `immediate` component flagged for preloading, with empty
    /// filters, in priority order.
    pub async fn preload(&self) -> BTreeMap<String, Result<LoadedComponent, EngineError>> {
        let requests: Vec<LoadRequest> = self
            .components()
            .into_iter()
            .filter(|component| {
                component.preload_data && component.load_strategy == LoadStrategy::Immediate
            })
            .map(|component| LoadRequest::new(component.component_id, Value::Null))
            .collect();
        info!(count = requests.len(), "preloading components");
        self.batch_load_components(requests).await
    }

    async fn wait_for_idle(&self, priority: u32) {
        loop {
            let settled = self.settled.notified();
            if !self.higher_priority_loading(priority) {
                return;
            }
            debug!(priority, "idle component waiting");
            settled.await;
        }
    }

    fn higher_priority_loading(&self, priority: u32) -> bool {
        rw_read(&self.components, SOURCE, "higher_priority_loading")
            .values()
            .any(|registered| {
                registered.state.status == LoadStatus::Loading
                    && registered.component.priority < priority
            })
    }
}

/// Rolls an attempt back to `Pending` when the `load_component` future is
/// dropped before the attempt settles, so idle components stop waiting on it.
struct AbandonOnDrop<'a> {
    loader: &'a ComponentLoader,
    component_id: &'a str,
    attempt: u64,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        let abandoned = rw_write(&self.loader.components, SOURCE, "abandon")
            .get_mut(self.component_id)
            .is_some_and(|registered| registered.state.abandon(self.attempt));
        if abandoned {
            debug!(
                component_id = self.component_id,
                attempt = self.attempt,
                "load abandoned by its caller"
            );
            self.loader.settled.notify_waiters();
        }
    }
}
