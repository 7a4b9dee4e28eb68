//! Sliding-window outlier statistics.
//!
//! Every verdict from the inference service is recorded into each configured
//! trailing window. A window keeps an exact outlier count plus running sums of
//! the raw score, so both the outlier ratio and a Gaussian density of the
//! score can be evaluated in O(1) per window.

use std::collections::VecDeque;
use std::f64::consts::PI;

use serde::Serialize;

use crate::config::validate_window_sizes;
use crate::error::ConfigError;
use crate::inference::InferenceVerdict;

#[derive(Debug, Clone)]
struct Window {
    size: usize,
    samples: VecDeque<InferenceVerdict>,
    outliers: usize,
    sum: f64,
    sum_sq: f64,
}

impl Window {
    fn new(size: usize) -> Self {
        Self {
            size,
            samples: VecDeque::with_capacity(size.min(1024)),
            outliers: 0,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    fn push(&mut self, verdict: InferenceVerdict) {
        if self.samples.len() == self.size {
            if let Some(old) = self.samples.pop_front() {
                if old.is_outlier {
                    self.outliers -= 1;
                }
                self.sum -= old.score;
                self.sum_sq -= old.score * old.score;
            }
        }
        if verdict.is_outlier {
            self.outliers += 1;
        }
        self.sum += verdict.score;
        self.sum_sq += verdict.score * verdict.score;
        self.samples.push_back(verdict);
    }

    fn ratio(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.outliers as f64 / self.samples.len() as f64
        }
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    fn std_dev(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let n = self.samples.len() as f64;
        let mean = self.sum / n;
        // running sums drift slightly below zero for constant input
        (self.sum_sq / n - mean * mean).max(0.0).sqrt()
    }

    fn stats(&self) -> WindowStats {
        WindowStats {
            size: self.size,
            samples: self.samples.len(),
            outliers: self.outliers,
            ratio: self.ratio(),
            mean: self.mean(),
            std_dev: self.std_dev(),
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.outliers = 0;
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

/// Snapshot of one window's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    /// Configured capacity in verdicts.
    pub size: usize,
    /// Verdicts currently held (never above `size`).
    pub samples: usize,
    pub outliers: usize,
    /// `outliers / samples`, 0.0 for an empty window.
    pub ratio: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl WindowStats {
    pub fn ratio_percent(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.outliers as f64 * 100.0 / self.samples as f64
        }
    }
}

/// Outlier counts and score statistics over several trailing windows.
#[derive(Debug, Clone)]
pub struct OutlierWindowTracker {
    windows: Vec<Window>,
    scores: ScoreAverage,
    total: u64,
}

impl OutlierWindowTracker {
    /// Create a tracker with one window per size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindows`] for an empty list, a zero size
    /// or duplicate sizes.
    pub fn new(sizes: &[usize]) -> Result<Self, ConfigError> {
        validate_window_sizes(sizes)?;
        Ok(Self {
            windows: sizes.iter().map(|&size| Window::new(size)).collect(),
            scores: ScoreAverage::new(crate::config::constants::SCORE_AVERAGE_CAPACITY),
            total: 0,
        })
    }

    /// Record a verdict into every window.
    pub fn record(&mut self, verdict: InferenceVerdict) {
        for window in &mut self.windows {
            window.push(verdict);
        }
        self.scores.add(verdict.score);
        self.total += 1;
    }

    /// Outlier ratio of the window with the given size.
    ///
    /// Empty and unknown windows report 0.0.
    pub fn outlier_ratio(&self, window: usize) -> f64 {
        self.window(window).map_or(0.0, Window::ratio)
    }

    pub fn outlier_count(&self, window: usize) -> usize {
        self.window(window).map_or(0, |w| w.outliers)
    }

    pub fn mean(&self, window: usize) -> f64 {
        self.window(window).map_or(0.0, Window::mean)
    }

    pub fn std_dev(&self, window: usize) -> f64 {
        self.window(window).map_or(0.0, Window::std_dev)
    }

    /// Normal density of `x` under the window's score mean and deviation.
    ///
    /// Returns 0.0 when the window is empty or has zero deviation.
    pub fn gaussian_density(&self, x: f64, window: usize) -> f64 {
        let Some(w) = self.window(window) else {
            return 0.0;
        };
        let sigma = w.std_dev();
        if w.samples.is_empty() || sigma == 0.0 {
            return 0.0;
        }
        let mu = w.mean();
        (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp() / ((2.0 * PI).sqrt() * sigma)
    }

    /// For each window, whether the newest score is more than `k` standard
    /// deviations from that window's mean.
    pub fn std_comparison(&self, k: f64) -> Vec<bool> {
        self.windows
            .iter()
            .map(|w| match w.samples.back() {
                Some(latest) => {
                    let sigma = w.std_dev();
                    sigma > 0.0 && (latest.score - w.mean()).abs() > k * sigma
                }
                None => false,
            })
            .collect()
    }

    /// Statistics of every window, in configuration order.
    pub fn stats(&self) -> Vec<WindowStats> {
        self.windows.iter().map(Window::stats).collect()
    }

    pub fn window_sizes(&self) -> Vec<usize> {
        self.windows.iter().map(|w| w.size).collect()
    }

    /// Verdicts recorded since the last reset.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Most recent verdict, if any.
    pub fn latest(&self) -> Option<InferenceVerdict> {
        self.windows.first().and_then(|w| w.samples.back().copied())
    }

    /// Moving average of the last `n` scores.
    pub fn score_average(&self, n: usize) -> f64 {
        self.scores.sma(n)
    }

    pub fn reset(&mut self) {
        for window in &mut self.windows {
            window.clear();
        }
        self.scores.clear();
        self.total = 0;
    }

    fn window(&self, size: usize) -> Option<&Window> {
        self.windows.iter().find(|w| w.size == size)
    }
}

/// Bounded simple moving average with running totals.
#[derive(Debug, Clone)]
pub struct ScoreAverage {
    capacity: usize,
    values: VecDeque<f64>,
    running_total: f64,
    count: u64,
}

impl ScoreAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: VecDeque::new(),
            running_total: 0.0,
            count: 0,
        }
    }

    pub fn add(&mut self, value: f64) {
        while self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.running_total += value;
        self.count += 1;
    }

    /// Average of the last `n` values, or of all held values if fewer.
    pub fn sma(&self, n: usize) -> f64 {
        let take = n.min(self.values.len());
        if take == 0 {
            return 0.0;
        }
        self.values.iter().rev().take(take).sum::<f64>() / take as f64
    }

    /// Average over every value ever added.
    pub fn cumulative_mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.running_total / self.count as f64
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.running_total = 0.0;
        self.count = 0;
    }
}
