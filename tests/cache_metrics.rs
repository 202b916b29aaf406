use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fathom::cache::{CacheConfig, SetOptions};
use fathom::infra::{InMemoryRemoteTier, RemoteTier, telemetry};
use fathom::monitor::{AlertThreshold, Comparison, MonitorConfig, Severity};
use fathom::optimizer::{ComputeOutput, DataSource, FilterSet, SourceError};
use fathom::{LayerConfig, PerformanceLayer};
use futures::future::join_all;
use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;

struct SlowSource {
    calls: AtomicUsize,
}

#[async_trait]
impl DataSource for SlowSource {
    async fn compute(
        &self,
        query_family: &str,
        _filters: &FilterSet,
    ) -> Result<ComputeOutput, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(ComputeOutput::new(
            json!({ "family": query_family }),
            ["purchase_orders"],
        ))
    }
}

#[tokio::test]
async fn engine_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let memory = Arc::new(InMemoryRemoteTier::new());
    let config = LayerConfig {
        cache: CacheConfig {
            local_capacity: 1,
            ..CacheConfig::default()
        },
        monitor: MonitorConfig {
            thresholds: vec![AlertThreshold::new(
                "requests.count",
                Comparison::GreaterThan,
                0.0,
                Severity::Low,
            )],
            ..MonitorConfig::default()
        },
        ..LayerConfig::default()
    };
    let source = Arc::new(SlowSource {
        calls: AtomicUsize::new(0),
    });
    let layer = PerformanceLayer::new(
        config,
        Arc::clone(&source) as Arc<dyn DataSource>,
        Some(Arc::clone(&memory) as Arc<dyn RemoteTier>),
    );
    let cache = layer.cache();

    // Local hit, remote hit (after local eviction) and miss.
    let first = cache.key("first");
    let second = cache.key("second");
    cache
        .set(&first, &json!(1), SetOptions::new().tags(["vendors"]))
        .await
        .expect("set first");
    assert_eq!(cache.get::<i64>(&first).await, Some(1));
    cache
        .set(&second, &json!(2), SetOptions::new())
        .await
        .expect("set second");
    assert_eq!(cache.get::<i64>(&first).await, Some(1));
    assert_eq!(cache.get::<i64>(&cache.key("absent")).await, None);
    assert!(cache.invalidate_by_tag("vendors").await >= 1);

    // Remote failure.
    memory.set_available(false);
    let _ = cache.get::<i64>(&cache.key("absent")).await;
    memory.set_available(true);

    // Computation, coalescing and strategy skips.
    let filters = json!({ "start": "2024-01-01" });
    let resolutions = join_all((0..3).map(|_| layer.optimizer().resolve("spend", &filters))).await;
    assert!(resolutions.iter().all(Result::is_ok));
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    // Alert fired, then resolved.
    assert_eq!(layer.monitor().evaluate_thresholds().len(), 1);
    layer.monitor().reset_counters();
    assert_eq!(layer.monitor().evaluate_thresholds().len(), 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "fathom_cache_local_hit_total",
        "fathom_cache_remote_hit_total",
        "fathom_cache_miss_total",
        "fathom_cache_evict_total",
        "fathom_cache_remote_error_total",
        "fathom_cache_invalidated_total",
        "fathom_query_compute_total",
        "fathom_query_coalesced_total",
        "fathom_query_resolve_ms",
        "fathom_strategy_unavailable_total",
        "fathom_alert_fired_total",
        "fathom_alert_resolved_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
