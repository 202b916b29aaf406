//! Cache configuration.
//!
//! Controls the process-local tier, TTL defaults and compression via the
//! `[cache]` section of `fathom.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_LOCAL_CAPACITY: usize = 1000;
const DEFAULT_TTL_SECONDS: u64 = 300;
const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 1024;
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_PURGE_INTERVAL_SECONDS: u64 = 60;

/// Cache configuration from `fathom.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries held by the process-local tier.
    pub local_capacity: usize,
    /// TTL applied when a write does not name one.
    pub default_ttl_seconds: u64,
    /// Serialized values larger than this are gzip-compressed when the
    /// writer asks for compression.
    pub compression_threshold_bytes: usize,
    /// Namespace used by callers that do not pick one.
    pub default_namespace: String,
    /// Use the networked tier when one is supplied.
    pub enable_remote: bool,
    /// Interval (s) of the background expired-entry sweep.
    pub purge_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: DEFAULT_LOCAL_CAPACITY,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD_BYTES,
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            enable_remote: true,
            purge_interval_seconds: DEFAULT_PURGE_INTERVAL_SECONDS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            local_capacity: settings.local_capacity.get(),
            default_ttl_seconds: settings.default_ttl.as_secs(),
            compression_threshold_bytes: settings.compression_threshold_bytes,
            default_namespace: settings.default_namespace.clone(),
            enable_remote: settings.enable_remote,
            purge_interval_seconds: settings.purge_interval.as_secs(),
        }
    }
}

impl CacheConfig {
    /// Returns the local capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn local_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.local_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds.max(1))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.local_capacity, 1000);
        assert_eq!(config.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.compression_threshold_bytes, 1024);
        assert_eq!(config.default_namespace, "default");
        assert!(config.enable_remote);
        assert_eq!(config.purge_interval(), Duration::from_secs(60));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            local_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.local_capacity_non_zero().get(), 1);
    }

    #[test]
    fn zero_durations_clamp_to_one_second() {
        let config = CacheConfig {
            default_ttl_seconds: 0,
            purge_interval_seconds: 0,
            ..Default::default()
        };
        assert_eq!(config.default_ttl(), Duration::from_secs(1));
        assert_eq!(config.purge_interval(), Duration::from_secs(1));
    }
}
