//! Streaming statistics
//!
//! Min, max, mean and standard deviation over an unbounded sample stream,
//! kept in constant memory.

use serde::{Deserialize, Serialize};

/// Running statistics over a numeric stream (Welford's algorithm)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Fold one sample into the running state
    #[inline]
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Smallest sample, 0 when empty
    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    /// Largest sample, 0 when empty
    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance, never negative
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0)
    }

    pub fn stdev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            min: self.min(),
            mean: self.mean(),
            stdev: self.stdev(),
            max: self.max(),
        }
    }
}

/// Frozen view of a [`RunningStats`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSummary {
    pub min: f64,
    pub mean: f64,
    pub stdev: f64,
    pub max: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        let scale = a.abs().max(b.abs()).max(1.0);
        assert!((a - b).abs() / scale < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_matches_direct_computation() {
        let samples = [54.0, 60.0, 1484.0, 40.0];
        let mut stats = RunningStats::new();
        for s in samples {
            stats.push(s);
        }

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        assert_eq!(stats.count(), 4);
        assert_close(stats.mean(), mean);
        assert_close(stats.stdev(), var.sqrt());
        assert_eq!(stats.min(), 40.0);
        assert_eq!(stats.max(), 1484.0);
    }

    #[test]
    fn test_empty_reports_zero() {
        let stats = RunningStats::new();
        assert!(stats.is_empty());
        assert_eq!(stats.summary(), StatsSummary::default());
    }

    #[test]
    fn test_constant_stream_has_zero_deviation() {
        let mut stats = RunningStats::new();
        for _ in 0..10_000 {
            stats.push(0.1);
        }
        assert!(stats.variance() >= 0.0);
        assert!(stats.stdev() < 1e-9);
        assert_close(stats.mean(), 0.1);
    }

    #[test]
    fn test_single_sample() {
        let mut stats = RunningStats::new();
        stats.push(1500.0);
        let s = stats.summary();
        assert_eq!(s.min, 1500.0);
        assert_eq!(s.max, 1500.0);
        assert_eq!(s.mean, 1500.0);
        assert_eq!(s.stdev, 0.0);
    }
}
