//! Composition root: wires the cache, monitor, optimizer and loader together
//! and exposes the operational surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheConfig, CacheCoordinator, CacheStatistics};
use crate::config::Settings;
use crate::infra::RemoteTier;
use crate::loader::{ComponentLoader, LoadingStatistics};
use crate::monitor::{MetricsMonitor, MetricsSnapshot, MonitorConfig, SeverityCounts};
use crate::optimizer::{DataSource, OptimizerConfig, QueryOptimizer, UsageCounts};

#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    pub evaluation_interval: Duration,
    pub counter_reset_interval: Duration,
    pub purge_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(30),
            counter_reset_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayerConfig {
    pub cache: CacheConfig,
    pub optimizer: OptimizerConfig,
    pub monitor: MonitorConfig,
    pub maintenance: MaintenanceConfig,
}

impl From<&Settings> for LayerConfig {
    fn from(settings: &Settings) -> Self {
        let cache = CacheConfig::from(&settings.cache);
        Self {
            maintenance: MaintenanceConfig {
                evaluation_interval: settings.monitor.evaluation_interval,
                counter_reset_interval: settings.monitor.counter_reset_interval,
                purge_interval: cache.purge_interval(),
            },
            cache,
            optimizer: OptimizerConfig::from(&settings.optimizer),
            monitor: MonitorConfig::from(&settings.monitor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: Health,
    /// Unresolved alerts per severity.
    pub alerts: SeverityCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvancedStats {
    pub cache: CacheStatistics,
    pub metrics: MetricsSnapshot,
    pub optimization: BTreeMap<String, UsageCounts>,
    pub failures: BTreeMap<String, u64>,
    pub loading: LoadingStatistics,
    pub in_flight: usize,
}

pub struct PerformanceLayer {
    cache: Arc<CacheCoordinator>,
    monitor: Arc<MetricsMonitor>,
    optimizer: Arc<QueryOptimizer>,
    loader: Arc<ComponentLoader>,
    maintenance: MaintenanceConfig,
}

impl PerformanceLayer {
    pub fn new(
        config: LayerConfig,
        source: Arc<dyn DataSource>,
        remote: Option<Arc<dyn RemoteTier>>,
    ) -> Self {
        let cache = Arc::new(CacheCoordinator::new(config.cache, remote));
        let monitor = Arc::new(MetricsMonitor::new(config.monitor));
        let optimizer = Arc::new(QueryOptimizer::new(
            Arc::clone(&cache),
            Arc::clone(&monitor),
            source,
            config.optimizer,
        ));
        let loader = Arc::new(ComponentLoader::new(Arc::clone(&optimizer)));

        Self {
            cache,
            monitor,
            optimizer,
            loader,
            maintenance: config.maintenance,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        source: Arc<dyn DataSource>,
        remote: Option<Arc<dyn RemoteTier>>,
    ) -> Self {
        Self::new(LayerConfig::from(settings), source, remote)
    }

    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<MetricsMonitor> {
        &self.monitor
    }

    pub fn optimizer(&self) -> &Arc<QueryOptimizer> {
        &self.optimizer
    }

    pub fn loader(&self) -> &Arc<ComponentLoader> {
        &self.loader
    }

    /// Rows of `entity_tag` changed: evict every result derived from them and
    /// send components depending on the tag back to `Pending`. Returns the
    /// number of cache entries removed.
    pub async fn notify_changed(&self, entity_tag: &str) -> usize {
        let removed = self.cache.invalidate_by_tag(entity_tag).await;
        let stale = self.loader.mark_stale(entity_tag);
        info!(entity_tag, removed, stale = stale.len(), "entity change notified");
        removed
    }

    pub async fn get_advanced_stats(&self) -> AdvancedStats {
        AdvancedStats {
            cache: self.cache.get_statistics().await,
            metrics: self.monitor.get_metrics(),
            optimization: self.optimizer.usage(),
            failures: self.optimizer.failures(),
            loading: self.loader.get_loading_statistics(),
            in_flight: self.optimizer.in_flight(),
        }
    }

    /// Unhealthy while any critical alert is unresolved.
    pub fn get_health_status(&self) -> HealthStatus {
        let alerts = self.monitor.alert_counts();
        let status = if alerts.critical > 0 {
            Health::Unhealthy
        } else {
            Health::Healthy
        };
        HealthStatus { status, alerts }
    }

    /// Spawn threshold evaluation, counter reset and expiry purge loops.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let monitor = Arc::clone(&self.monitor);
        let evaluation = spawn_interval(self.maintenance.evaluation_interval, move || {
            let events = monitor.evaluate_thresholds();
            if !events.is_empty() {
                debug!(events = events.len(), "thresholds evaluated");
            }
        });

        let monitor = Arc::clone(&self.monitor);
        let counter_reset = spawn_interval(self.maintenance.counter_reset_interval, move || {
            monitor.reset_counters();
        });

        let cache = Arc::clone(&self.cache);
        let purge = spawn_interval(self.maintenance.purge_interval, move || {
            cache.purge_expired();
        });

        info!(
            evaluation_secs = self.maintenance.evaluation_interval.as_secs(),
            counter_reset_secs = self.maintenance.counter_reset_interval.as_secs(),
            purge_secs = self.maintenance.purge_interval.as_secs(),
            "maintenance tasks started"
        );
        MaintenanceHandle {
            tasks: vec![evaluation, counter_reset, purge],
        }
    }
}

fn spawn_interval<F>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            tick();
        }
    })
}

/// Background maintenance tasks; they run until [`shutdown`](Self::shutdown).
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("maintenance tasks stopped");
    }
}
