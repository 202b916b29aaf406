//! Query resolution chain.
//!
//! Strategies are tried in a fixed order and the first one that produces a
//! result wins:
//!
//! 1. plain cache entry for `family + fingerprint`
//! 2. materialized snapshot (compressed, own TTL)
//! 3. incremental delta on top of a fresh base (eligible families only)
//! 4. full computation by the data source, coalesced per key
//!
//! Failures of 1-3 are `StrategyUnavailable` and only recorded. A failure of
//! 4 is returned to every caller waiting on it and nothing is cached.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{Span, debug, info, instrument, warn};

use crate::cache::lock::mutex_lock;
use crate::cache::{CacheCoordinator, CacheKey, SetOptions, Tag};
use crate::error::EngineError;
use crate::monitor::MetricsMonitor;

use super::filters::{FilterSet, Fingerprint};
use super::inflight::{InFlight, Role};
use super::policy::{FamilyPolicy, OptimizerConfig, TtlScale};
use super::source::DataSource;
use super::strategy::{
    QueryResolutionRecord, ResolutionHistory, SkippedStrategy, Strategy, StrategyUnavailable,
    UsageCounts, serialize_millis,
};

const SOURCE: &str = "optimizer::resolver";
const METRIC_RESOLVE_MS: &str = "fathom_query_resolve_ms";
const METRIC_COMPUTE: &str = "fathom_query_compute_total";
const METRIC_COALESCED: &str = "fathom_query_coalesced_total";
const METRIC_UNAVAILABLE: &str = "fathom_strategy_unavailable_total";

/// Per-call overrides of the family policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// TTL of the plain cache entry written by this call.
    pub cache_ttl: Option<Duration>,
    /// Deadline for a full computation started by this call.
    pub timeout: Option<Duration>,
}

impl ResolveOptions {
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionMetrics {
    /// Strategies in the order they were attempted; the last one answered.
    pub optimization_used: Vec<Strategy>,
    pub cache_hit: bool,
    /// Joined a full computation another caller had already started.
    pub coalesced: bool,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub records_processed: u64,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub data: Value,
    pub metrics: ResolutionMetrics,
}

impl Resolution {
    pub fn served_by(&self) -> Option<Strategy> {
        self.metrics.optimization_used.last().copied()
    }
}

/// Payload stored under every optimizer key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredResult {
    data: Value,
    tags: BTreeSet<Tag>,
    records_processed: u64,
    #[serde(with = "time::serde::rfc3339")]
    computed_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct QueryKeys {
    plain: CacheKey,
    materialized: CacheKey,
    delta_base: CacheKey,
}

impl QueryKeys {
    fn new(namespace: &str, query_family: &str, fingerprint: &Fingerprint) -> Self {
        Self {
            plain: CacheKey::new(namespace, format!("{query_family}:{fingerprint}")),
            materialized: CacheKey::new(
                namespace,
                format!("materialized:{query_family}:{fingerprint}"),
            ),
            delta_base: CacheKey::new(namespace, format!("delta_base:{query_family}:{fingerprint}")),
        }
    }
}

/// What one resolution attempted so far.
struct Trail<'a> {
    query_family: &'a str,
    fingerprint: Fingerprint,
    started: Instant,
    attempted: Vec<Strategy>,
    skipped: Vec<SkippedStrategy>,
}

impl<'a> Trail<'a> {
    fn new(query_family: &'a str, fingerprint: Fingerprint, started: Instant) -> Self {
        Self {
            query_family,
            fingerprint,
            started,
            attempted: Vec::with_capacity(4),
            skipped: Vec::new(),
        }
    }

    fn attempt(&mut self, strategy: Strategy) {
        self.attempted.push(strategy);
    }

    fn skip(&mut self, strategy: Strategy, reason: StrategyUnavailable) {
        if reason != StrategyUnavailable::NotEligible {
            counter!(
                METRIC_UNAVAILABLE,
                "strategy" => strategy.as_str(),
                "reason" => reason.reason_code()
            )
            .increment(1);
            debug!(%strategy, %reason, "strategy unavailable");
        }
        self.skipped.push(SkippedStrategy {
            strategy,
            reason: reason.to_string(),
        });
    }
}

type ComputeOutcome = Result<StoredResult, String>;

pub struct QueryOptimizer {
    config: OptimizerConfig,
    cache: Arc<CacheCoordinator>,
    monitor: Arc<MetricsMonitor>,
    source: Arc<dyn DataSource>,
    in_flight: InFlight<ComputeOutcome>,
    history: Mutex<ResolutionHistory>,
}

impl QueryOptimizer {
    pub fn new(
        cache: Arc<CacheCoordinator>,
        monitor: Arc<MetricsMonitor>,
        source: Arc<dyn DataSource>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            history: Mutex::new(ResolutionHistory::new(config.history_limit)),
            config,
            cache,
            monitor,
            source,
            in_flight: InFlight::new(|err| Err(format!("computation task failed: {err}"))),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    /// Plain-entry TTL for `query_family` scaled by a component's cache
    /// strategy.
    pub fn cache_ttl_for(&self, query_family: &str, scale: TtlScale) -> Duration {
        self.config.policy(query_family).scaled_cache_ttl(scale)
    }

    pub async fn resolve(&self, query_family: &str, filters: &Value) -> Result<Resolution, EngineError> {
        self.resolve_with(query_family, filters, ResolveOptions::default())
            .await
    }

    #[instrument(skip(self, filters, options), fields(fingerprint = tracing::field::Empty))]
    pub async fn resolve_with(
        &self,
        query_family: &str,
        filters: &Value,
        options: ResolveOptions,
    ) -> Result<Resolution, EngineError> {
        let started = Instant::now();
        let epoch = self.cache.invalidation_epoch();
        let filters = FilterSet::normalize(filters).map_err(|reason| {
            debug!(%reason, "rejected filters");
            EngineError::InvalidFilter {
                query_family: query_family.to_string(),
                reason,
            }
        })?;
        let fingerprint = filters.fingerprint();
        Span::current().record("fingerprint", tracing::field::display(&fingerprint));

        let policy = self.config.policy(query_family).clone();
        let keys = QueryKeys::new(&self.config.namespace, query_family, &fingerprint);
        let cache_ttl = options.cache_ttl.unwrap_or(policy.cache_ttl);
        let mut trail = Trail::new(query_family, fingerprint, started);

        trail.attempt(Strategy::Cache);
        match self.cache.try_get::<StoredResult>(&keys.plain).await {
            Ok(Some(stored)) => return Ok(self.served(trail, stored, 0, true, false)),
            Ok(None) => {}
            Err(_) => trail.skip(Strategy::Cache, StrategyUnavailable::Corrupt),
        }

        if policy.materialized {
            trail.attempt(Strategy::MaterializedView);
            match self.materialized(&keys).await {
                Ok(stored) => {
                    self.write_plain(&keys, &stored, cache_ttl, epoch).await;
                    return Ok(self.served(trail, stored, 0, false, false));
                }
                Err(reason) => trail.skip(Strategy::MaterializedView, reason),
            }
        } else {
            trail.skip(Strategy::MaterializedView, StrategyUnavailable::NotEligible);
        }

        if policy.incremental {
            trail.attempt(Strategy::IncrementalDelta);
            match self.incremental(query_family, &filters, &keys, &policy).await {
                Ok(stored) => {
                    persist(&self.cache, &keys, &stored, cache_ttl, &policy, epoch).await;
                    let records = stored.records_processed;
                    return Ok(self.served(trail, stored, records, false, false));
                }
                Err(reason) => trail.skip(Strategy::IncrementalDelta, reason),
            }
        } else {
            trail.skip(Strategy::IncrementalDelta, StrategyUnavailable::NotEligible);
        }

        trail.attempt(Strategy::FullComputation);
        let job = ComputeJob {
            cache: Arc::clone(&self.cache),
            source: Arc::clone(&self.source),
            query_family: query_family.to_string(),
            filters,
            keys: keys.clone(),
            timeout: options.timeout.unwrap_or(policy.compute_timeout),
            policy,
            cache_ttl,
        };
        let (computation, role) = self
            .in_flight
            .join_or_start(&keys.plain.to_string(), move || job.run());
        let coalesced = role == Role::Follower;
        if coalesced {
            counter!(METRIC_COALESCED).increment(1);
            debug!("joined in-flight computation");
        }

        match computation.await {
            Ok(stored) => {
                let records = stored.records_processed;
                Ok(self.served(trail, stored, records, false, coalesced))
            }
            Err(reason) => Err(self.failed(trail, reason, coalesced)),
        }
    }

    /// Most recent resolutions of `query_family`, oldest first.
    pub fn history(&self, query_family: &str) -> Vec<QueryResolutionRecord> {
        mutex_lock(&self.history, SOURCE, "history").for_family(query_family)
    }

    /// Per family: how many resolutions each strategy served.
    pub fn usage(&self) -> BTreeMap<String, UsageCounts> {
        mutex_lock(&self.history, SOURCE, "usage").usage()
    }

    /// Per family: resolutions that ended in an error.
    pub fn failures(&self) -> BTreeMap<String, u64> {
        mutex_lock(&self.history, SOURCE, "failures").failures()
    }

    /// Full computations currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn materialized(&self, keys: &QueryKeys) -> Result<StoredResult, StrategyUnavailable> {
        match self.cache.try_get::<StoredResult>(&keys.materialized).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Err(StrategyUnavailable::Missing),
            Err(_) => Err(StrategyUnavailable::Corrupt),
        }
    }

    async fn incremental(
        &self,
        query_family: &str,
        filters: &FilterSet,
        keys: &QueryKeys,
        policy: &FamilyPolicy,
    ) -> Result<StoredResult, StrategyUnavailable> {
        let base = match self.cache.try_get::<StoredResult>(&keys.delta_base).await {
            Ok(Some(base)) => base,
            Ok(None) => return Err(StrategyUnavailable::Missing),
            Err(_) => return Err(StrategyUnavailable::Corrupt),
        };

        let now = OffsetDateTime::now_utc();
        let age_seconds = u64::try_from((now - base.computed_at).whole_seconds()).unwrap_or(0);
        let window_seconds = policy.delta_freshness.as_secs();
        if age_seconds > window_seconds {
            return Err(StrategyUnavailable::Stale {
                age_seconds,
                window_seconds,
            });
        }

        let delta = tokio::time::timeout(
            policy.compute_timeout,
            self.source
                .compute_delta(query_family, filters, &base.data, base.computed_at),
        )
        .await
        .map_err(|_| StrategyUnavailable::Rejected("delta computation timed out".to_string()))?
        .map_err(|err| StrategyUnavailable::Rejected(err.to_string()))?
        .ok_or_else(|| StrategyUnavailable::Rejected("no incremental update available".to_string()))?;

        let mut tags = base.tags;
        tags.extend(delta.touched_tags);
        Ok(StoredResult {
            data: delta.result,
            tags,
            records_processed: delta.records_processed,
            computed_at: now,
        })
    }

    async fn write_plain(
        &self,
        keys: &QueryKeys,
        stored: &StoredResult,
        ttl: Duration,
        epoch: u64,
    ) {
        if stale_since(&self.cache, stored, epoch) {
            return;
        }
        let options = SetOptions::new().ttl(ttl).tags(stored.tags.iter().cloned());
        if let Err(err) = self.cache.set(&keys.plain, stored, options).await {
            warn!(error = %err, "query result not cached");
        }
        if self.cache.invalidated_since(&stored.tags, epoch) {
            self.cache.delete(&keys.plain).await;
        }
    }

    fn served(
        &self,
        trail: Trail<'_>,
        stored: StoredResult,
        records_processed: u64,
        cache_hit: bool,
        coalesced: bool,
    ) -> Resolution {
        let fingerprint = trail.fingerprint.clone();
        let (optimization_used, elapsed) =
            self.record(trail, records_processed, cache_hit, coalesced, true);
        debug!(
            strategy = ?optimization_used.last(),
            cache_hit,
            coalesced,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "query resolved"
        );

        Resolution {
            data: stored.data,
            metrics: ResolutionMetrics {
                optimization_used,
                cache_hit,
                coalesced,
                elapsed,
                records_processed,
                fingerprint,
            },
        }
    }

    fn failed(&self, trail: Trail<'_>, reason: String, coalesced: bool) -> EngineError {
        warn!(%reason, coalesced, "full computation failed");
        let query_family = trail.query_family.to_string();
        let fingerprint = trail.fingerprint.clone();
        self.record(trail, 0, false, coalesced, false);
        EngineError::ComputationFailed {
            query_family,
            fingerprint,
            reason,
        }
    }

    fn record(
        &self,
        trail: Trail<'_>,
        records_processed: u64,
        cache_hit: bool,
        coalesced: bool,
        succeeded: bool,
    ) -> (Vec<Strategy>, Duration) {
        let elapsed = trail.started.elapsed();
        histogram!(METRIC_RESOLVE_MS, "query_family" => trail.query_family.to_string())
            .record(elapsed.as_secs_f64() * 1000.0);
        self.monitor.record_request(elapsed, succeeded);
        self.monitor.record_cache_lookup(cache_hit);

        mutex_lock(&self.history, SOURCE, "record").push(QueryResolutionRecord {
            query_family: trail.query_family.to_string(),
            filter_fingerprint: trail.fingerprint,
            strategy_used: trail.attempted.clone(),
            skipped: trail.skipped,
            elapsed,
            records_processed,
            cache_hit,
            coalesced,
            succeeded,
            recorded_at: OffsetDateTime::now_utc(),
        });
        (trail.attempted, elapsed)
    }
}

/// A full computation. It runs on its own task, so it settles and persists
/// even when every caller waiting on it is dropped.
struct ComputeJob {
    cache: Arc<CacheCoordinator>,
    source: Arc<dyn DataSource>,
    query_family: String,
    filters: FilterSet,
    keys: QueryKeys,
    policy: FamilyPolicy,
    cache_ttl: Duration,
    timeout: Duration,
}

impl ComputeJob {
    async fn run(self) -> ComputeOutcome {
        counter!(METRIC_COMPUTE, "query_family" => self.query_family.clone()).increment(1);
        let epoch = self.cache.invalidation_epoch();
        let computed_at = OffsetDateTime::now_utc();

        let computation = self.source.compute(&self.query_family, &self.filters);
        let output = match tokio::time::timeout(self.timeout, computation).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(err.to_string()),
            Err(_) => {
                return Err(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                ));
            }
        };
        info!(
            query_family = %self.query_family,
            records = output.records_processed,
            tags = output.touched_tags.len(),
            "full computation finished"
        );

        let stored = StoredResult {
            data: output.result,
            tags: output.touched_tags,
            records_processed: output.records_processed,
            computed_at,
        };
        persist(&self.cache, &self.keys, &stored, self.cache_ttl, &self.policy, epoch).await;
        Ok(stored)
    }
}

/// True when one of the result's tags was invalidated after `epoch`, in which
/// case the result is still returned but must not be cached.
fn stale_since(cache: &CacheCoordinator, stored: &StoredResult, epoch: u64) -> bool {
    let stale = cache.invalidated_since(&stored.tags, epoch);
    if stale {
        debug!(epoch, "dependencies changed while resolving, result not cached");
    }
    stale
}

/// Write a result to the plain key, the materialized snapshot and, for
/// incremental families, the delta base. The base is left untagged: a
/// delta reads every change since its timestamp, so invalidation would only
/// discard a usable base.
///
/// Nothing is written if a tag of the result was invalidated after `epoch`.
/// An invalidation racing the writes themselves is undone afterwards.
async fn persist(
    cache: &CacheCoordinator,
    keys: &QueryKeys,
    stored: &StoredResult,
    cache_ttl: Duration,
    policy: &FamilyPolicy,
    epoch: u64,
) {
    if stale_since(cache, stored, epoch) {
        return;
    }
    let tagged = || SetOptions::new().tags(stored.tags.iter().cloned());
    let mut writes = vec![(keys.plain.clone(), stored, tagged().ttl(cache_ttl))];
    if policy.materialized {
        writes.push((
            keys.materialized.clone(),
            stored,
            tagged().ttl(policy.materialized_ttl).compress(true),
        ));
    }
    if policy.incremental {
        writes.push((
            keys.delta_base.clone(),
            stored,
            SetOptions::new().ttl(policy.delta_freshness).compress(true),
        ));
    }

    for outcome in cache.batch_set(writes).await {
        if let Err(err) = outcome {
            warn!(error = %err, "query result not cached");
        }
    }

    if cache.invalidated_since(&stored.tags, epoch) {
        for key in [&keys.plain, &keys.materialized, &keys.delta_base] {
            cache.delete(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::monitor::MonitorConfig;
    use crate::optimizer::policy::BUDGET_UTILIZATION;
    use crate::optimizer::source::{ComputeOutput, SourceError};

    #[derive(Default)]
    struct ScriptedSource {
        computes: AtomicUsize,
        deltas: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
        supports_delta: bool,
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn compute(
            &self,
            query_family: &str,
            filters: &FilterSet,
        ) -> Result<ComputeOutput, SourceError> {
            let call = self.computes.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::failed("warehouse offline"));
            }
            Ok(ComputeOutput::new(
                json!({ "family": query_family, "call": call, "filters": filters.to_value() }),
                ["purchase_orders", "vendors", "vessels"],
            )
            .with_records(10))
        }

        async fn compute_delta(
            &self,
            _query_family: &str,
            _filters: &FilterSet,
            base: &Value,
            _since: OffsetDateTime,
        ) -> Result<Option<ComputeOutput>, SourceError> {
            if !self.supports_delta {
                return Ok(None);
            }
            self.deltas.fetch_add(1, Ordering::SeqCst);
            let mut merged = base.clone();
            merged["delta"] = json!(true);
            Ok(Some(ComputeOutput::new(merged, ["budgets"]).with_records(2)))
        }
    }

    fn optimizer(source: Arc<ScriptedSource>) -> QueryOptimizer {
        QueryOptimizer::new(
            Arc::new(CacheCoordinator::local_only(CacheConfig::default())),
            Arc::new(MetricsMonitor::new(MonitorConfig::default())),
            source,
            OptimizerConfig::default(),
        )
    }

    fn keys_for(optimizer: &QueryOptimizer, family: &str, filters: &Value) -> QueryKeys {
        let fingerprint = FilterSet::normalize(filters).expect("filters").fingerprint();
        QueryKeys::new(&optimizer.config().namespace, family, &fingerprint)
    }

    #[tokio::test]
    async fn cold_then_warm() {
        let source = Arc::new(ScriptedSource::default());
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01", "end": "2024-12-31"});

        let cold = optimizer.resolve("spend", &filters).await.expect("cold");
        assert!(!cold.metrics.cache_hit);
        assert_eq!(
            cold.metrics.optimization_used,
            vec![Strategy::Cache, Strategy::MaterializedView, Strategy::FullComputation]
        );
        assert_eq!(cold.metrics.records_processed, 10);

        let warm = optimizer.resolve("spend", &filters).await.expect("warm");
        assert!(warm.metrics.cache_hit);
        assert_eq!(warm.metrics.optimization_used, vec![Strategy::Cache]);
        assert_eq!(warm.data, cold.data);
        assert_eq!(source.computes.load(Ordering::SeqCst), 1);

        let usage = optimizer.usage();
        let spend = usage.get("spend").expect("usage tracked");
        assert_eq!(spend.get(&Strategy::FullComputation), Some(&1));
        assert_eq!(spend.get(&Strategy::Cache), Some(&1));
        assert_eq!(optimizer.history("spend").len(), 2);
    }

    #[tokio::test]
    async fn results_are_tagged_with_touched_entities() {
        let source = Arc::new(ScriptedSource::default());
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});
        optimizer.resolve("spend", &filters).await.expect("resolve");

        let keys = keys_for(&optimizer, "spend", &filters);
        let tags = optimizer.cache().tags_for_key(&keys.plain);
        assert_eq!(
            tags.into_iter().collect::<Vec<_>>(),
            vec!["purchase_orders", "vendors", "vessels"]
        );
        assert!(!optimizer.cache().tags_for_key(&keys.materialized).is_empty());
    }

    #[tokio::test]
    async fn materialized_snapshot_skips_the_source() {
        let source = Arc::new(ScriptedSource::default());
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});
        optimizer.resolve("spend", &filters).await.expect("seed");

        let keys = keys_for(&optimizer, "spend", &filters);
        assert!(optimizer.cache().delete(&keys.plain).await);

        let resolved = optimizer.resolve("spend", &filters).await.expect("materialized");
        assert_eq!(
            resolved.metrics.optimization_used,
            vec![Strategy::Cache, Strategy::MaterializedView]
        );
        assert_eq!(source.computes.load(Ordering::SeqCst), 1);

        let again = optimizer.resolve("spend", &filters).await.expect("plain again");
        assert!(again.metrics.cache_hit);
    }

    #[tokio::test]
    async fn incremental_delta_updates_a_fresh_base() {
        let source = Arc::new(ScriptedSource {
            supports_delta: true,
            ..ScriptedSource::default()
        });
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"fiscal_year": 2024});
        optimizer.resolve(BUDGET_UTILIZATION, &filters).await.expect("seed");

        let keys = keys_for(&optimizer, BUDGET_UTILIZATION, &filters);
        optimizer.cache().delete(&keys.plain).await;
        optimizer.cache().delete(&keys.materialized).await;

        let resolved = optimizer
            .resolve(BUDGET_UTILIZATION, &filters)
            .await
            .expect("delta");
        assert_eq!(resolved.served_by(), Some(Strategy::IncrementalDelta));
        assert_eq!(resolved.data["delta"], json!(true));
        assert_eq!(resolved.metrics.records_processed, 2);
        assert_eq!(source.computes.load(Ordering::SeqCst), 1);
        assert_eq!(source.deltas.load(Ordering::SeqCst), 1);

        let tags = optimizer.cache().tags_for_key(&keys.plain);
        assert!(tags.contains("budgets") && tags.contains("vendors"));
    }

    #[tokio::test]
    async fn stale_base_falls_through_to_full_computation() {
        let source = Arc::new(ScriptedSource {
            supports_delta: true,
            ..ScriptedSource::default()
        });
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"fiscal_year": 2024});
        let keys = keys_for(&optimizer, BUDGET_UTILIZATION, &filters);

        let stale = StoredResult {
            data: json!({"old": true}),
            tags: BTreeSet::new(),
            records_processed: 1,
            computed_at: OffsetDateTime::now_utc() - time::Duration::hours(2),
        };
        optimizer
            .cache()
            .set(&keys.delta_base, &stale, SetOptions::new())
            .await
            .expect("seed base");

        let resolved = optimizer
            .resolve(BUDGET_UTILIZATION, &filters)
            .await
            .expect("full");
        assert_eq!(resolved.served_by(), Some(Strategy::FullComputation));
        assert_eq!(source.deltas.load(Ordering::SeqCst), 0);

        let record = optimizer
            .history(BUDGET_UTILIZATION)
            .pop()
            .expect("recorded");
        assert!(
            record
                .skipped
                .iter()
                .any(|skip| skip.strategy == Strategy::IncrementalDelta && skip.reason.contains("old"))
        );
    }

    #[tokio::test]
    async fn unsupported_delta_is_not_an_error() {
        let source = Arc::new(ScriptedSource::default());
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"fiscal_year": 2024});
        optimizer.resolve(BUDGET_UTILIZATION, &filters).await.expect("seed");

        let keys = keys_for(&optimizer, BUDGET_UTILIZATION, &filters);
        optimizer.cache().delete(&keys.plain).await;
        optimizer.cache().delete(&keys.materialized).await;

        let resolved = optimizer
            .resolve(BUDGET_UTILIZATION, &filters)
            .await
            .expect("full");
        assert_eq!(resolved.served_by(), Some(Strategy::FullComputation));
        assert_eq!(source.computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_fails_without_caching() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(200),
            ..ScriptedSource::default()
        });
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});

        let err = optimizer
            .resolve_with(
                "spend",
                &filters,
                ResolveOptions::default().timeout(Duration::from_millis(20)),
            )
            .await
            .expect_err("must time out");
        assert!(matches!(&err, EngineError::ComputationFailed { reason, .. } if reason.contains("timed out")));

        let keys = keys_for(&optimizer, "spend", &filters);
        assert!(optimizer.cache().get_entry(&keys.plain).await.is_none());
        assert!(optimizer.cache().get_entry(&keys.materialized).await.is_none());
        assert_eq!(optimizer.in_flight(), 0);
    }

    #[tokio::test]
    async fn source_failure_surfaces_and_is_not_cached() {
        let source = Arc::new(ScriptedSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});

        let err = optimizer.resolve("spend", &filters).await.expect_err("fails");
        assert_eq!(err.code(), "computation_failed");
        assert!(!err.to_string().contains("spend:"));
        assert_eq!(optimizer.failures().get("spend"), Some(&1));

        source.fail.store(false, Ordering::SeqCst);
        let resolved = optimizer.resolve("spend", &filters).await.expect("recovers");
        assert!(!resolved.metrics.cache_hit);
        assert_eq!(source.computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_filters_fail_before_the_cache() {
        let source = Arc::new(ScriptedSource::default());
        let optimizer = optimizer(Arc::clone(&source));

        let err = optimizer
            .resolve("spend", &json!(["not", "an", "object"]))
            .await
            .expect_err("invalid");
        assert!(matches!(err, EngineError::InvalidFilter { .. }));
        assert_eq!(source.computes.load(Ordering::SeqCst), 0);
        assert!(optimizer.history("spend").is_empty());
    }

    #[tokio::test]
    async fn concurrent_cold_callers_share_one_computation() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(50),
            ..ScriptedSource::default()
        });
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});

        let results = join_all((0..10).map(|_| optimizer.resolve("spend", &filters))).await;

        assert_eq!(source.computes.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().expect("resolved");
        assert!(results.iter().all(|result| {
            result.as_ref().map(|r| r.data == first.data).unwrap_or(false)
        }));
        let coalesced = results
            .iter()
            .filter(|result| result.as_ref().map(|r| r.metrics.coalesced).unwrap_or(false))
            .count();
        assert_eq!(coalesced, 9);
        assert_eq!(optimizer.in_flight(), 0);
    }

    #[test]
    fn component_cache_scale_applies_to_family_ttl() {
        let optimizer = optimizer(Arc::new(ScriptedSource::default()));
        assert_eq!(
            optimizer.cache_ttl_for("spend", TtlScale::Quadruple),
            Duration::from_secs(1200)
        );
        assert_eq!(
            optimizer.cache_ttl_for("spend", TtlScale::Quarter),
            Duration::from_secs(75)
        );
    }

    #[tokio::test]
    async fn computation_outlives_a_caller_that_gave_up() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(100),
            ..ScriptedSource::default()
        });
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            optimizer.resolve_with("spend", &filters, ResolveOptions::default()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(optimizer.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(optimizer.in_flight(), 0);
        let keys = keys_for(&optimizer, "spend", &filters);
        assert!(optimizer.cache().get_entry(&keys.plain).await.is_some());

        let warm = optimizer.resolve("spend", &filters).await.expect("warm");
        assert!(warm.metrics.cache_hit);
        assert_eq!(source.computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_during_computation_is_not_overwritten() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(50),
            ..ScriptedSource::default()
        });
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});

        let (resolved, _) = tokio::join!(optimizer.resolve("spend", &filters), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            optimizer.cache().invalidate_by_tag("vendors").await
        });
        assert_eq!(resolved.expect("still served").data["call"], json!(1));

        let keys = keys_for(&optimizer, "spend", &filters);
        assert!(optimizer.cache().get_entry(&keys.plain).await.is_none());
        assert!(optimizer.cache().get_entry(&keys.materialized).await.is_none());

        let fresh = optimizer.resolve("spend", &filters).await.expect("recomputed");
        assert!(!fresh.metrics.cache_hit);
        assert_eq!(fresh.data["call"], json!(2));
        assert_eq!(source.computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unrelated_invalidation_still_caches() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(50),
            ..ScriptedSource::default()
        });
        let optimizer = optimizer(Arc::clone(&source));
        let filters = json!({"start": "2024-01-01"});

        let (resolved, _) = tokio::join!(optimizer.resolve("spend", &filters), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            optimizer.cache().invalidate_by_tag("budgets").await
        });
        resolved.expect("served");

        let warm = optimizer.resolve("spend", &filters).await.expect("warm");
        assert!(warm.metrics.cache_hit);
    }
}
