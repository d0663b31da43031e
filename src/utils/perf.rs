//! Timing utilities

use std::collections::VecDeque;
use std::time::Duration;

/// Sliding window of durations
#[derive(Debug, Clone)]
pub struct TimingTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl TimingTracker {
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or(Duration::ZERO)
    }

    /// 95th percentile of the window
    pub fn percentile_95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_and_stats() {
        let mut tracker = TimingTracker::new(3);
        assert_eq!(tracker.average(), Duration::ZERO);
        assert_eq!(tracker.percentile_95(), Duration::ZERO);

        for ms in [10, 20, 30, 40] {
            tracker.record(Duration::from_millis(ms));
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.average(), Duration::from_millis(30));
        assert_eq!(tracker.max(), Duration::from_millis(40));
        assert_eq!(tracker.percentile_95(), Duration::from_millis(40));

        tracker.clear();
        assert_eq!(tracker.count(), 0);
    }
}
