//! Fathom: performance layer in front of an analytics store.
//!
//! [`PerformanceLayer`] wires the two-tier [`cache`], the query
//! [`optimizer`], the [`loader`] for dashboard components and the metrics
//! [`monitor`] together.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod loader;
pub mod monitor;
pub mod optimizer;
pub mod service;

pub use error::EngineError;
pub use service::{
    AdvancedStats, Health, HealthStatus, LayerConfig, MaintenanceConfig, MaintenanceHandle,
    PerformanceLayer,
};
