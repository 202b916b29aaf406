use std::collections::VecDeque;

use serde::Serialize;

/// Bounded window holding the most recent samples of one metric stream.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Non-finite samples are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn summary(&self) -> WindowSummary {
        if self.samples.is_empty() {
            return WindowSummary::default();
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let sum: f64 = sorted.iter().sum();

        WindowSummary {
            count: sorted.len(),
            mean: sum / sorted.len() as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Aggregates over a window. All zero when the window is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Nearest-rank percentile over ascending `sorted` samples.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_most_recent_samples() {
        let mut window = RollingWindow::new(3);
        for value in [1.0, 2.0, 3.0, 4.0] {
            window.push(value);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.summary().min, 2.0);
        assert_eq!(window.latest(), Some(4.0));
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let mut window = RollingWindow::new(1000);
        for value in 1..=100 {
            window.push(f64::from(value));
        }
        let summary = window.summary();
        assert_eq!(summary.p50, 50.0);
        assert_eq!(summary.p95, 95.0);
        assert_eq!(summary.p99, 99.0);
        assert_eq!(summary.max, 100.0);
        assert!((summary.mean - 50.5).abs() < 1e-9);
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let mut window = RollingWindow::new(10);
        window.push(7.5);
        let summary = window.summary();
        assert_eq!((summary.p50, summary.p95, summary.p99), (7.5, 7.5, 7.5));
    }

    #[test]
    fn empty_window_summarises_to_zero() {
        assert_eq!(RollingWindow::new(5).summary(), WindowSummary::default());
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn non_finite_samples_are_dropped() {
        let mut window = RollingWindow::new(5);
        window.push(f64::NAN);
        window.push(f64::INFINITY);
        assert!(window.is_empty());
    }
}
