//! Resolution strategies and the bookkeeping kept about them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use super::filters::Fingerprint;

/// Strategies in the order the optimizer tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Cache,
    MaterializedView,
    IncrementalDelta,
    FullComputation,
}

impl Strategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::MaterializedView => "materialized_view",
            Self::IncrementalDelta => "incremental_delta",
            Self::FullComputation => "full_computation",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cheaper strategy could not answer. Never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyUnavailable {
    #[error("not enabled for this query family")]
    NotEligible,
    #[error("no stored result")]
    Missing,
    #[error("base result is {age_seconds}s old, freshness window is {window_seconds}s")]
    Stale { age_seconds: u64, window_seconds: u64 },
    #[error("stored result is unreadable")]
    Corrupt,
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StrategyUnavailable {
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::NotEligible => "not_eligible",
            Self::Missing => "missing",
            Self::Stale { .. } => "stale",
            Self::Corrupt => "corrupt",
            Self::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedStrategy {
    pub strategy: Strategy,
    pub reason: String,
}

/// One resolution, kept in a bounded per-family history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResolutionRecord {
    pub query_family: String,
    pub filter_fingerprint: Fingerprint,
    pub strategy_used: Vec<Strategy>,
    pub skipped: Vec<SkippedStrategy>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub records_processed: u64,
    pub cache_hit: bool,
    pub coalesced: bool,
    pub succeeded: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl QueryResolutionRecord {
    /// Strategy that produced the answer, if any did.
    pub fn served_by(&self) -> Option<Strategy> {
        if self.succeeded {
            self.strategy_used.last().copied()
        } else {
            None
        }
    }
}

pub(crate) fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64() * 1000.0)
}

/// Strategy -> number of resolutions it served.
pub type UsageCounts = BTreeMap<Strategy, u64>;

/// Last `limit` resolutions per query family plus usage counts.
#[derive(Debug)]
pub(crate) struct ResolutionHistory {
    limit: usize,
    records: HashMap<String, VecDeque<QueryResolutionRecord>>,
    usage: BTreeMap<String, UsageCounts>,
    failures: BTreeMap<String, u64>,
}

impl ResolutionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            records: HashMap::new(),
            usage: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, record: QueryResolutionRecord) {
        match record.served_by() {
            Some(strategy) => {
                *self
                    .usage
                    .entry(record.query_family.clone())
                    .or_default()
                    .entry(strategy)
                    .or_default() += 1;
            }
            None => {
                *self.failures.entry(record.query_family.clone()).or_default() += 1;
            }
        }

        let records = self.records.entry(record.query_family.clone()).or_default();
        if records.len() == self.limit {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn for_family(&self, query_family: &str) -> Vec<QueryResolutionRecord> {
        self.records
            .get(query_family)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn usage(&self) -> BTreeMap<String, UsageCounts> {
        self.usage.clone()
    }

    pub fn failures(&self) -> BTreeMap<String, u64> {
        self.failures.clone()
    }
}
