//! # drift
//!
//! Tracks how the measured clock offset moves over time and extrapolates it
//! between sync runs. A positive rate means the remote clock runs faster
//! than ours.

use std::collections::VecDeque;

/// Retention window for drift samples.
const WINDOW_NANOS: i64 = 600 * 1_000_000_000;

/// Minimum observation span before the regression is trusted.
const MIN_SPAN_NANOS: i64 = 30 * 1_000_000_000;

/// (local timestamp, measured offset) history with linear-regression
/// extrapolation. Updated from the sync task; read via snapshots.
#[derive(Debug, Clone, Default)]
pub struct DriftTracker {
    samples: VecDeque<(i64, i64)>,
}

impl DriftTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful sync result. Prunes anything older than the
    /// 10-minute window.
    pub fn push(&mut self, local_nanos: i64, offset_nanos: i64) {
        self.samples.push_back((local_nanos, offset_nanos));
        let cutoff = local_nanos - WINDOW_NANOS;
        while let Some(&(t, _)) = self.samples.front() {
            if t < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn span_nanos(&self) -> i64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(first, _)), Some(&(last, _))) => last - first,
            _ => 0,
        }
    }

    /// Whether enough history exists for prediction.
    pub fn has_estimate(&self) -> bool {
        self.samples.len() >= 2 && self.span_nanos() >= MIN_SPAN_NANOS
    }

    /// Least-squares slope of offset over local time, in nanoseconds of
    /// offset change per second of local time. None below the 30 s span.
    pub fn drift_rate_ns_per_s(&self) -> Option<f64> {
        if !self.has_estimate() {
            return None;
        }
        let n = self.samples.len() as f64;
        let t0 = self.samples.front().map(|&(t, _)| t).unwrap_or(0);

        let mut mean_t = 0.0;
        let mut mean_o = 0.0;
        for &(t, o) in &self.samples {
            mean_t += (t - t0) as f64 / 1e9;
            mean_o += o as f64;
        }
        mean_t /= n;
        mean_o /= n;

        let mut num = 0.0;
        let mut den = 0.0;
        for &(t, o) in &self.samples {
            let dt = (t - t0) as f64 / 1e9 - mean_t;
            num += dt * (o as f64 - mean_o);
            den += dt * dt;
        }
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    }

    /// Drift rate in parts per million.
    pub fn drift_ppm(&self) -> Option<f64> {
        self.drift_rate_ns_per_s().map(|r| r / 1000.0)
    }

    /// Predicted offset at `at_nanos`. With an estimate, extrapolates from
    /// the most recent measurement; otherwise returns the most recent
    /// measured offset as-is.
    pub fn predict_offset(&self, at_nanos: i64) -> Option<i64> {
        let &(last_t, last_o) = self.samples.back()?;
        match self.drift_rate_ns_per_s() {
            Some(rate) => {
                let dt_secs = (at_nanos - last_t) as f64 / 1e9;
                Some(last_o + (rate * dt_secs) as i64)
            }
            None => Some(last_o),
        }
    }
}
