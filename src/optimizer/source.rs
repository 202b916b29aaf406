//! Contract with the external analytical data source.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::Tag;

use super::filters::FilterSet;

/// Result of one computation together with the entity tags it read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeOutput {
    pub result: Value,
    pub touched_tags: BTreeSet<Tag>,
    #[serde(default)]
    pub records_processed: u64,
}

impl ComputeOutput {
    pub fn new<I, S>(result: Value, touched_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Tag>,
    {
        Self {
            result,
            touched_tags: touched_tags.into_iter().map(Into::into).collect(),
            records_processed: 0,
        }
    }

    pub fn with_records(mut self, records_processed: u64) -> Self {
        self.records_processed = records_processed;
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("query family `{0}` is not supported by this data source")]
    UnsupportedFamily(String),
    #[error("data source failed: {0}")]
    Failed(String),
}

impl SourceError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Computes analytical results.
///
/// Implementations must be deterministic for identical filters within the
/// cache validity window, and must report every entity tag the computation
/// read: a missing tag means a stale result survives invalidation.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn compute(
        &self,
        query_family: &str,
        filters: &FilterSet,
    ) -> Result<ComputeOutput, SourceError>;

    /// Bring `base`, computed at `since`, up to date by reading only the
    /// entities changed after `since`. The returned `result` replaces `base`
    /// entirely.
    ///
    /// `Ok(None)` means the family cannot be updated incrementally; the
    /// caller then falls back to a full computation.
    async fn compute_delta(
        &self,
        _query_family: &str,
        _filters: &FilterSet,
        _base: &Value,
        _since: OffsetDateTime,
    ) -> Result<Option<ComputeOutput>, SourceError> {
        Ok(None)
    }
}
