//! Cumulative cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidated: AtomicU64,
    remote_errors: AtomicU64,
    lookups: AtomicU64,
    lookup_micros: AtomicU64,
}

impl StatsRecorder {
    pub fn local_hit(&self, elapsed: Duration) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
        self.lookup(elapsed);
    }

    pub fn remote_hit(&self, elapsed: Duration) {
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
        self.lookup(elapsed);
    }

    pub fn miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.lookup(elapsed);
    }

    pub fn set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidated(&self, count: usize) {
        self.invalidated.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn remote_error(&self) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn lookup(&self, elapsed: Duration) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.lookup_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.local_hits,
            &self.remote_hits,
            &self.misses,
            &self.sets,
            &self.invalidated,
            &self.remote_errors,
            &self.lookups,
            &self.lookup_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, tier_sizes: TierSizes) -> CacheStatistics {
        let local_hits = self.local_hits.load(Ordering::Relaxed);
        let remote_hits = self.remote_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hits = local_hits + remote_hits;
        let lookups = self.lookups.load(Ordering::Relaxed);

        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };
        let avg_latency_ms = if lookups == 0 {
            0.0
        } else {
            self.lookup_micros.load(Ordering::Relaxed) as f64 / lookups as f64 / 1000.0
        };

        CacheStatistics {
            hits,
            misses,
            hit_rate,
            local_hits,
            remote_hits,
            sets: self.sets.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            tier_sizes,
            avg_latency_ms,
        }
    }
}

/// Entry counts per tier. `remote` is `None` when no networked tier is
/// configured or it could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierSizes {
    pub local: usize,
    pub local_bytes: usize,
    pub remote: Option<usize>,
}

/// Statistics accumulated since the last reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub sets: u64,
    pub invalidated: u64,
    pub remote_errors: u64,
    pub tier_sizes: TierSizes,
    pub avg_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> TierSizes {
        TierSizes {
            local: 0,
            local_bytes: 0,
            remote: None,
        }
    }

    #[test]
    fn hit_rate_counts_both_tiers() {
        let stats = StatsRecorder::default();
        stats.local_hit(Duration::from_micros(10));
        stats.remote_hit(Duration::from_micros(30));
        stats.miss(Duration::from_micros(20));
        stats.miss(Duration::from_micros(20));

        let snapshot = stats.snapshot(sizes());
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 2);
        assert!((snapshot.hit_rate - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.avg_latency_ms - 0.02).abs() < 1e-9);
    }

    #[test]
    fn empty_statistics_do_not_divide_by_zero() {
        let snapshot = StatsRecorder::default().snapshot(sizes());
        assert_eq!(snapshot.hit_rate, 0.0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
    }

    #[test]
    fn reset_zeroes_counters() {
        let stats = StatsRecorder::default();
        stats.local_hit(Duration::from_micros(5));
        stats.set();
        stats.invalidated(3);
        stats.reset();

        let snapshot = stats.snapshot(sizes());
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.sets, 0);
        assert_eq!(snapshot.invalidated, 0);
    }
}
