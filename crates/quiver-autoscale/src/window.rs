//! Sliding metric windows

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Ring of timestamped samples retained for a fixed window. Single
/// writer per metric; readers ask for the mean over a trailing slice.
#[derive(Debug)]
pub struct MetricWindow {
    samples: VecDeque<(Instant, f64)>,
    retention: Duration,
}

impl MetricWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.record_at(Instant::now(), value);
    }

    pub fn record_at(&mut self, at: Instant, value: f64) {
        self.samples.push_back((at, value));
        self.trim(at);
    }

    /// Mean over the trailing `window`, which must not exceed the
    /// retention. `None` when no samples fall inside it.
    pub fn mean_over(&self, window: Duration) -> Option<f64> {
        self.mean_over_at(Instant::now(), window)
    }

    pub fn mean_over_at(&self, now: Instant, window: Duration) -> Option<f64> {
        let cutoff = now.checked_sub(window.min(self.retention));
        let mut sum = 0.0;
        let mut count = 0usize;
        for (at, value) in &self.samples {
            let inside = match cutoff {
                Some(cutoff) => *at >= cutoff,
                // Process younger than the window: everything counts.
                None => true,
            };
            if inside {
                sum += value;
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn trim(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return;
        };
        while let Some((at, _)) = self.samples.front() {
            if *at < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_over_trailing_slice() {
        let mut window = MetricWindow::new(Duration::from_secs(600));
        let base = Instant::now();
        window.record_at(base, 10.0);
        window.record_at(base + Duration::from_secs(100), 20.0);
        window.record_at(base + Duration::from_secs(200), 30.0);

        let now = base + Duration::from_secs(200);
        // Only the last two samples fall in the trailing 150 s.
        let mean = window.mean_over_at(now, Duration::from_secs(150)).unwrap();
        assert!((mean - 25.0).abs() < 1e-9);

        let all = window.mean_over_at(now, Duration::from_secs(600)).unwrap();
        assert!((all - 20.0).abs() < 1e-9);
    }

    #[test]
    fn retention_evicts_old_samples() {
        let mut window = MetricWindow::new(Duration::from_secs(60));
        let base = Instant::now();
        window.record_at(base, 1.0);
        window.record_at(base + Duration::from_secs(120), 2.0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn empty_window_has_no_mean() {
        let window = MetricWindow::new(Duration::from_secs(60));
        assert!(window.mean_over(Duration::from_secs(10)).is_none());
    }
}
