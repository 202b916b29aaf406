//! In-process metrics and alerting.
//!
//! Samples land in bounded rolling windows; counters (requests, errors,
//! cache lookups) accumulate until [`MetricsMonitor::reset_counters`] starts
//! a new counting window. Thresholds are evaluated against
//! [`MetricsSnapshot`] paths.

mod alert;
mod snapshot;
mod window;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::counter;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::cache::lock::mutex_lock;

pub use alert::{Alert, AlertEvent, AlertThreshold, Comparison, Severity, SeverityCounts};
pub use snapshot::{CacheLookupStats, ErrorStats, MetricsSnapshot, RequestStats};
pub use window::{RollingWindow, WindowSummary, percentile};

use alert::AlertBook;

const SOURCE: &str = "monitor";
const METRIC_ALERT_FIRED: &str = "fathom_alert_fired_total";
const METRIC_ALERT_RESOLVED: &str = "fathom_alert_resolved_total";

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub window_size: usize,
    pub alert_history_limit: usize,
    pub thresholds: Vec<AlertThreshold>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            alert_history_limit: 500,
            thresholds: AlertThreshold::defaults(),
        }
    }
}

impl From<&crate::config::MonitorSettings> for MonitorConfig {
    fn from(settings: &crate::config::MonitorSettings) -> Self {
        Self {
            window_size: settings.window_size.get(),
            alert_history_limit: settings.alert_history_limit.get(),
            thresholds: settings.thresholds.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: u64,
    errors: u64,
    cache_hits: u64,
    cache_misses: u64,
}

struct MonitorState {
    response_time: RollingWindow,
    resources: HashMap<String, RollingWindow>,
    streams: HashMap<String, RollingWindow>,
    counters: Counters,
    counting_since: Instant,
    alerts: AlertBook,
}

pub struct MetricsMonitor {
    window_size: usize,
    state: Mutex<MonitorState>,
}

impl MetricsMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            window_size,
            state: Mutex::new(MonitorState {
                response_time: RollingWindow::new(window_size),
                resources: HashMap::new(),
                streams: HashMap::new(),
                counters: Counters::default(),
                counting_since: Instant::now(),
                alerts: AlertBook::new(config.thresholds, config.alert_history_limit),
            }),
        }
    }

    /// One served request: its latency and whether it succeeded.
    pub fn record_request(&self, elapsed: Duration, success: bool) {
        let mut state = mutex_lock(&self.state, SOURCE, "record_request");
        state.response_time.push(elapsed.as_secs_f64() * 1000.0);
        state.counters.requests += 1;
        if !success {
            state.counters.errors += 1;
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let mut state = mutex_lock(&self.state, SOURCE, "record_cache_lookup");
        if hit {
            state.counters.cache_hits += 1;
        } else {
            state.counters.cache_misses += 1;
        }
    }

    /// Resource usage sample, e.g. `memory_mb` or `cpu_percent`.
    pub fn record_resource(&self, name: &str, value: f64) {
        let window_size = self.window_size;
        let mut state = mutex_lock(&self.state, SOURCE, "record_resource");
        state
            .resources
            .entry(name.to_string())
            .or_insert_with(|| RollingWindow::new(window_size))
            .push(value);
    }

    /// Free-form sample stream, exposed under `streams.<name>`.
    pub fn record_sample(&self, stream: &str, value: f64) {
        let window_size = self.window_size;
        let mut state = mutex_lock(&self.state, SOURCE, "record_sample");
        state
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| RollingWindow::new(window_size))
            .push(value);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let state = mutex_lock(&self.state, SOURCE, "get_metrics");
        Self::snapshot(&state)
    }

    fn snapshot(state: &MonitorState) -> MetricsSnapshot {
        let counters = &state.counters;
        let window_seconds = state.counting_since.elapsed().as_secs_f64();
        let lookups = counters.cache_hits + counters.cache_misses;

        MetricsSnapshot {
            response_time: state.response_time.summary(),
            requests: RequestStats {
                count: counters.requests,
                throughput_per_sec: if window_seconds > 0.0 {
                    counters.requests as f64 / window_seconds
                } else {
                    0.0
                },
            },
            errors: ErrorStats {
                count: counters.errors,
                rate_percent: ratio_percent(counters.errors, counters.requests),
            },
            cache: CacheLookupStats {
                hits: counters.cache_hits,
                misses: counters.cache_misses,
                hit_rate_percent: ratio_percent(counters.cache_hits, lookups),
            },
            resources: summarise(&state.resources),
            streams: summarise(&state.streams),
            window_seconds,
            captured_at: OffsetDateTime::now_utc(),
        }
    }

    /// Start a new counting window. Rolling sample windows are kept.
    pub fn reset_counters(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "reset_counters");
        state.counters = Counters::default();
        state.counting_since = Instant::now();
    }

    pub fn evaluate_thresholds(&self) -> Vec<AlertEvent> {
        self.evaluate_thresholds_at(OffsetDateTime::now_utc())
    }

    /// Evaluate against the current snapshot as if the clock read `now`.
    pub fn evaluate_thresholds_at(&self, now: OffsetDateTime) -> Vec<AlertEvent> {
        let events = {
            let mut state = mutex_lock(&self.state, SOURCE, "evaluate_thresholds");
            let snapshot = Self::snapshot(&state);
            state.alerts.evaluate(&snapshot, now)
        };

        for event in &events {
            let alert = event.alert();
            match event {
                AlertEvent::Fired(_) => {
                    counter!(METRIC_ALERT_FIRED, "severity" => alert.severity.as_str()).increment(1);
                    warn!(
                        alert_id = %alert.id,
                        metric = %alert.metric,
                        observed = alert.observed_value,
                        threshold = alert.threshold.value,
                        severity = %alert.severity,
                        "alert fired"
                    );
                }
                AlertEvent::Resolved(_) => {
                    counter!(METRIC_ALERT_RESOLVED, "severity" => alert.severity.as_str())
                        .increment(1);
                    info!(
                        alert_id = %alert.id,
                        metric = %alert.metric,
                        observed = alert.observed_value,
                        "alert resolved"
                    );
                }
            }
        }
        events
    }

    pub fn add_threshold(&self, threshold: AlertThreshold) {
        mutex_lock(&self.state, SOURCE, "add_threshold")
            .alerts
            .add_threshold(threshold);
    }

    /// Remove by [`AlertThreshold::key`]. Returns false if unknown.
    pub fn remove_threshold(&self, key: &str) -> bool {
        mutex_lock(&self.state, SOURCE, "remove_threshold")
            .alerts
            .remove_threshold(key)
    }

    pub fn thresholds(&self) -> Vec<AlertThreshold> {
        mutex_lock(&self.state, SOURCE, "thresholds")
            .alerts
            .thresholds()
            .to_vec()
    }

    /// Unresolved alerts, most severe first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        mutex_lock(&self.state, SOURCE, "active_alerts").alerts.active()
    }

    /// Recent alerts, oldest first, resolved ones included.
    pub fn alert_history(&self) -> Vec<Alert> {
        mutex_lock(&self.state, SOURCE, "alert_history").alerts.history()
    }

    pub fn alert_counts(&self) -> SeverityCounts {
        mutex_lock(&self.state, SOURCE, "alert_counts").alerts.counts()
    }
}

fn ratio_percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn summarise(windows: &HashMap<String, RollingWindow>) -> BTreeMap<String, WindowSummary> {
    windows
        .iter()
        .map(|(name, window)| (name.clone(), window.summary()))
        .collect()
}
