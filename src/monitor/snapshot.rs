//! Point-in-time view of the monitor, addressable by dotted path.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use super::window::WindowSummary;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    /// Requests since the last counter reset.
    pub count: u64,
    pub throughput_per_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub count: u64,
    pub rate_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheLookupStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

/// Paths such as `response_time.p95`, `errors.rate_percent` or
/// `resources.memory_mb.mean` resolve against the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Milliseconds.
    pub response_time: WindowSummary,
    pub requests: RequestStats,
    pub errors: ErrorStats,
    pub cache: CacheLookupStats,
    pub resources: BTreeMap<String, WindowSummary>,
    pub streams: BTreeMap<String, WindowSummary>,
    pub window_seconds: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

impl MetricsSnapshot {
    /// Numeric value at a dotted path, if present.
    pub fn lookup(&self, path: &str) -> Option<f64> {
        let tree = serde_json::to_value(self).ok()?;
        let mut node = &tree;
        for segment in path.split('.') {
            node = match node {
                Value::Object(map) => map.get(segment)?,
                _ => return None,
            };
        }
        node.as_f64()
    }
}
