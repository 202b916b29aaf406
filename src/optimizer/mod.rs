//! Query optimizer.
//!
//! Resolves `(query_family, filters)` through a fixed strategy chain on top
//! of [`CacheCoordinator`](crate::cache::CacheCoordinator), delegating full
//! computations to a [`DataSource`]. Concurrent cold requests for the same
//! key share a single computation.

mod filters;
mod inflight;
mod policy;
mod resolver;
mod source;
mod strategy;

pub use filters::{FilterSet, Fingerprint, fingerprint};
pub use policy::{BUDGET_UTILIZATION, FamilyPolicy, OptimizerConfig, TtlScale};
pub use resolver::{QueryOptimizer, Resolution, ResolutionMetrics, ResolveOptions};
pub use source::{ComputeOutput, DataSource, SourceError};
pub use strategy::{
    QueryResolutionRecord, SkippedStrategy, Strategy, StrategyUnavailable, UsageCounts,
};
