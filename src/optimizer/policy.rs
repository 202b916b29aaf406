//! Per-query-family strategy eligibility and timing.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

/// Family that supports incremental delta resolution unless configured
/// otherwise.
pub const BUDGET_UTILIZATION: &str = "budget_utilization";

const MIN_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyPolicy {
    pub incremental: bool,
    pub materialized: bool,
    pub cache_ttl: Duration,
    pub materialized_ttl: Duration,
    pub delta_freshness: Duration,
    pub compute_timeout: Duration,
}

impl Default for FamilyPolicy {
    fn default() -> Self {
        Self {
            incremental: false,
            materialized: true,
            cache_ttl: Duration::from_secs(300),
            materialized_ttl: Duration::from_secs(3600),
            delta_freshness: Duration::from_secs(3600),
            compute_timeout: Duration::from_secs(30),
        }
    }
}

/// How long a component's cache strategy keeps results, relative to the
/// family TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlScale {
    Quadruple,
    Unchanged,
    Quarter,
}

impl FamilyPolicy {
    pub fn scaled_cache_ttl(&self, scale: TtlScale) -> Duration {
        let ttl = match scale {
            TtlScale::Quadruple => self.cache_ttl.saturating_mul(4),
            TtlScale::Unchanged => self.cache_ttl,
            TtlScale::Quarter => self.cache_ttl / 4,
        };
        ttl.max(MIN_TTL)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerConfig {
    /// Cache namespace all optimizer keys live in.
    pub namespace: String,
    pub defaults: FamilyPolicy,
    pub families: HashMap<String, FamilyPolicy>,
    pub history_limit: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let defaults = FamilyPolicy::default();
        let mut families = HashMap::new();
        families.insert(
            BUDGET_UTILIZATION.to_string(),
            FamilyPolicy {
                incremental: true,
                ..defaults.clone()
            },
        );
        Self {
            namespace: "query".to_string(),
            defaults,
            families,
            history_limit: 100,
        }
    }
}

impl OptimizerConfig {
    pub fn policy(&self, query_family: &str) -> &FamilyPolicy {
        self.families.get(query_family).unwrap_or(&self.defaults)
    }

    pub fn with_family(mut self, query_family: impl Into<String>, policy: FamilyPolicy) -> Self {
        self.families.insert(query_family.into(), policy);
        self
    }
}

impl From<&crate::config::OptimizerSettings> for OptimizerConfig {
    fn from(settings: &crate::config::OptimizerSettings) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            defaults: settings.defaults.clone(),
            families: settings.families.clone(),
            history_limit: settings.history_limit.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_utilization_is_incremental_by_default() {
        let config = OptimizerConfig::default();
        assert!(config.policy(BUDGET_UTILIZATION).incremental);
        assert!(!config.policy("spend_analytics").incremental);
        assert!(config.policy("spend_analytics").materialized);
    }

    #[test]
    fn cache_ttl_scales_with_floor() {
        let policy = FamilyPolicy {
            cache_ttl: Duration::from_secs(2),
            ..FamilyPolicy::default()
        };
        assert_eq!(policy.scaled_cache_ttl(TtlScale::Quadruple), Duration::from_secs(8));
        assert_eq!(policy.scaled_cache_ttl(TtlScale::Unchanged), Duration::from_secs(2));
        assert_eq!(policy.scaled_cache_ttl(TtlScale::Quarter), Duration::from_secs(1));
    }

    #[test]
    fn family_override_replaces_defaults() {
        let config = OptimizerConfig::default().with_family(
            "spend_analytics",
            FamilyPolicy {
                materialized: false,
                ..FamilyPolicy::default()
            },
        );
        assert!(!config.policy("spend_analytics").materialized);
    }
}
