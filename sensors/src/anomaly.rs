//! Anomaly detection for a single device's readings.
//!
//! A reading is suspicious when its innovation (measurement minus filter
//! prediction) is large both relative to what the filter expected and
//! relative to the innovations recently observed, or when it arrives at an
//! implausible time.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Sliding window for time-series statistics
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    data: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    sum_sq: f64,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Add value to window
    pub fn push(&mut self, value: f64) {
        if self.data.len() >= self.capacity {
            if let Some(old) = self.data.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }

        self.data.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum / self.data.len() as f64
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.data.len() < 2 {
            return 0.0;
        }
        let n = self.data.len() as f64;
        // running sums can go slightly negative through cancellation
        ((self.sum_sq - (self.sum * self.sum) / n) / (n - 1.0)).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Deviation of `value` from the window mean in standard deviations
    pub fn z_score(&self, value: f64) -> f64 {
        let sd = self.std_dev();
        if sd == 0.0 {
            return 0.0;
        }
        (value - self.mean()) / sd
    }
}

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Innovation threshold in standard deviations
    pub sigma: f64,
    /// Samples to observe before innovations are judged
    pub min_samples: usize,
    /// History kept per channel
    pub window: usize,
    /// Gaps longer than this are implausible (seconds)
    pub max_gap_secs: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sigma: 4.0,
            min_samples: 5,
            window: 32,
            max_gap_secs: 6.0 * 3600.0,
        }
    }
}

/// Why a reading was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    GravityOutlier,
    TemperatureOutlier,
    /// Timestamp at or before the previous sample
    ClockSkew,
    /// Nothing heard for longer than `max_gap_secs`
    MissedScans,
}

/// Per-channel innovation history
#[derive(Debug, Clone)]
pub struct InnovationTracker {
    history: SlidingWindow,
}

impl InnovationTracker {
    pub fn new(window: usize) -> Self {
        Self { history: SlidingWindow::new(window) }
    }

    /// Judge `innovation` and then remember it.
    ///
    /// The innovation has to stand out from the filter's own expectation
    /// (`innovation_variance`) and from recent history.
    pub fn observe(&mut self, innovation: f64, innovation_variance: f64, config: &AnomalyConfig) -> bool {
        let judged = self.history.len() >= config.min_samples && innovation_variance > 0.0;
        let outlier = judged && {
            let filter_z = innovation.abs() / innovation_variance.sqrt();
            let history_z = self.history.z_score(innovation).abs();
            let history_flat = self.history.std_dev() == 0.0;
            filter_z > config.sigma && (history_flat || history_z > config.sigma)
        };
        self.history.push(innovation);
        outlier
    }

    pub fn history(&self) -> &SlidingWindow {
        &self.history
    }
}

/// Check the spacing between consecutive samples.
pub fn check_timing(elapsed_secs: f64, config: &AnomalyConfig) -> Option<AnomalyKind> {
    if elapsed_secs <= 0.0 {
        Some(AnomalyKind::ClockSkew)
    } else if elapsed_secs > config.max_gap_secs {
        Some(AnomalyKind::MissedScans)
    } else {
        None
    }
}
