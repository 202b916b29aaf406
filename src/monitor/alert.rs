//! Threshold evaluation with hysteresis.
//!
//! An alert opens once its condition has held for `min_duration` and stays
//! open until an evaluation sees the condition false. At most one alert per
//! threshold is open at a time; re-triggering after resolution opens a new
//! alert with the next generation number.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::snapshot::MetricsSnapshot;

const EQUAL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "gt")]
    GreaterThan,
    #[serde(rename = "lt")]
    LessThan,
    #[serde(rename = "eq")]
    Equal,
}

impl Comparison {
    pub fn holds(self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => observed > threshold,
            Self::LessThan => observed < threshold,
            Self::Equal => (observed - threshold).abs() <= EQUAL_EPSILON,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GreaterThan => "gt",
            Self::LessThan => "lt",
            Self::Equal => "eq",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    /// Dotted path into [`MetricsSnapshot`].
    pub metric: String,
    pub operator: Comparison,
    pub value: f64,
    pub severity: Severity,
    #[serde(default)]
    pub min_duration_ms: u64,
}

impl AlertThreshold {
    pub fn new(metric: impl Into<String>, operator: Comparison, value: f64, severity: Severity) -> Self {
        Self {
            metric: metric.into(),
            operator,
            value,
            severity,
            min_duration_ms: 0,
        }
    }

    pub fn min_duration(mut self, min_duration: Duration) -> Self {
        self.min_duration_ms = u64::try_from(min_duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Deterministic identity shared by every alert this threshold raises.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.metric, self.operator.as_str(), self.value)
    }

    /// Thresholds used when none are configured.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("response_time.p95", Comparison::GreaterThan, 2000.0, Severity::High),
            Self::new("errors.rate_percent", Comparison::GreaterThan, 5.0, Severity::Critical),
            Self::new(
                "resources.memory_mb.mean",
                Comparison::GreaterThan,
                8192.0,
                Severity::Medium,
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// `key#generation`.
    pub id: String,
    pub key: String,
    pub metric: String,
    pub observed_value: f64,
    pub threshold: AlertThreshold,
    pub severity: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub fired_at: OffsetDateTime,
    pub resolved: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "alert", rename_all = "snake_case")]
pub enum AlertEvent {
    Fired(Alert),
    Resolved(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            Self::Fired(alert) | Self::Resolved(alert) => alert,
        }
    }
}

/// Unresolved alerts per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AlertBook {
    thresholds: Vec<AlertThreshold>,
    /// When each threshold's condition was first seen true without an open
    /// alert yet.
    pending_since: HashMap<String, OffsetDateTime>,
    open: HashMap<String, Alert>,
    generations: HashMap<String, u64>,
    history: VecDeque<Alert>,
    history_limit: usize,
}

impl AlertBook {
    pub fn new(thresholds: Vec<AlertThreshold>, history_limit: usize) -> Self {
        let mut book = Self {
            thresholds: Vec::new(),
            pending_since: HashMap::new(),
            open: HashMap::new(),
            generations: HashMap::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        };
        for threshold in thresholds {
            book.add_threshold(threshold);
        }
        book
    }

    /// Replaces a threshold with the same key.
    pub fn add_threshold(&mut self, threshold: AlertThreshold) {
        let key = threshold.key();
        self.thresholds.retain(|existing| existing.key() != key);
        self.thresholds.push(threshold);
    }

    /// Its open alert, if any, resolves on the next evaluation.
    pub fn remove_threshold(&mut self, key: &str) -> bool {
        let before = self.thresholds.len();
        self.thresholds.retain(|existing| existing.key() != key);
        self.pending_since.remove(key);
        self.thresholds.len() != before
    }

    pub fn thresholds(&self) -> &[AlertThreshold] {
        &self.thresholds
    }

    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot, now: OffsetDateTime) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for threshold in self.thresholds.clone() {
            let key = threshold.key();
            let Some(observed) = snapshot.lookup(&threshold.metric) else {
                continue;
            };

            if threshold.operator.holds(observed, threshold.value) {
                if let Some(open) = self.open.get_mut(&key) {
                    open.observed_value = observed;
                    continue;
                }
                let since = *self.pending_since.entry(key.clone()).or_insert(now);
                let held_ms = (now - since).whole_milliseconds().max(0) as u128;
                if held_ms >= u128::from(threshold.min_duration_ms) {
                    self.pending_since.remove(&key);
                    events.push(AlertEvent::Fired(self.fire(key, threshold, observed, now)));
                }
            } else {
                self.pending_since.remove(&key);
                if let Some(alert) = self.resolve(&key, observed, now) {
                    events.push(AlertEvent::Resolved(alert));
                }
            }
        }

        let orphaned: Vec<String> = self
            .open
            .keys()
            .filter(|key| !self.thresholds.iter().any(|threshold| &threshold.key() == *key))
            .cloned()
            .collect();
        for key in orphaned {
            let observed = self.open.get(&key).map(|alert| alert.observed_value).unwrap_or(0.0);
            if let Some(alert) = self.resolve(&key, observed, now) {
                events.push(AlertEvent::Resolved(alert));
            }
        }

        events
    }

    fn fire(&mut self, key: String, threshold: AlertThreshold, observed: f64, now: OffsetDateTime) -> Alert {
        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;

        let alert = Alert {
            id: format!("{key}#{generation}"),
            key: key.clone(),
            metric: threshold.metric.clone(),
            observed_value: observed,
            severity: threshold.severity,
            threshold,
            fired_at: now,
            resolved: false,
            resolved_at: None,
        };
        self.open.insert(key, alert.clone());
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(alert.clone());
        alert
    }

    fn resolve(&mut self, key: &str, observed: f64, now: OffsetDateTime) -> Option<Alert> {
        let mut alert = self.open.remove(key)?;
        alert.observed_value = observed;
        alert.resolved = true;
        alert.resolved_at = Some(now);

        if let Some(recorded) = self.history.iter_mut().rev().find(|recorded| recorded.id == alert.id) {
            *recorded = alert.clone();
        }
        Some(alert)
    }

    pub fn active(&self) -> Vec<Alert> {
        let mut active: Vec<Alert> = self.open.values().cloned().collect();
        active.sort_by(|a, b| a.severity.cmp(&b.severity).then(a.fired_at.cmp(&b.fired_at)));
        active
    }

    pub fn history(&self) -> Vec<Alert> {
        self.history.iter().cloned().collect()
    }

    pub fn counts(&self) -> SeverityCounts {
        let mut counts = SeverityCounts::default();
        for alert in self.open.values() {
            counts.add(alert.severity);
        }
        counts
    }
}
