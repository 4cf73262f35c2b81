//! Throughput sample collection for bench reports.
//!
//! Samples are kept in full; a regression run records a few hundred
//! values at most.

use serde::Serialize;

/// Completed-throughput statistics for one burst.
#[derive(Debug, Clone, Default)]
pub struct ThroughputStats {
    /// Recorded throughput samples in kbps, in arrival order.
    samples: Vec<f64>,
    /// Minimum observed throughput.
    min_kbps: f64,
    /// Maximum observed throughput.
    max_kbps: f64,
    /// Sum of all samples for mean calculation.
    sum_kbps: f64,
}

impl ThroughputStats {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            min_kbps: f64::INFINITY,
            max_kbps: 0.0,
            sum_kbps: 0.0,
        }
    }

    /// Record one measured throughput.
    pub fn record(&mut self, comp_kbps: f64) {
        self.samples.push(comp_kbps);
        self.min_kbps = self.min_kbps.min(comp_kbps);
        self.max_kbps = self.max_kbps.max(comp_kbps);
        self.sum_kbps += comp_kbps;
    }

    /// Number of samples recorded.
    #[must_use]
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Minimum observed throughput.
    #[must_use]
    pub fn min(&self) -> Option<f64> {
        (!self.samples.is_empty()).then_some(self.min_kbps)
    }

    /// Maximum observed throughput.
    #[must_use]
    pub fn max(&self) -> Option<f64> {
        (!self.samples.is_empty()).then_some(self.max_kbps)
    }

    /// Mean throughput.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        (!self.samples.is_empty()).then(|| self.sum_kbps / self.samples.len() as f64)
    }

    /// Compute a percentile (nearest rank) over the recorded samples.
    ///
    /// # Arguments
    ///
    /// * `percentile` - Value in the range 0.0 to 100.0.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        let rank = ((percentile.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    /// Summarize the samples relative to a nominal bus speed.
    #[must_use]
    pub fn summary(&self, speed_kbps: u32) -> ThroughputSummary {
        let pct = |kbps: f64| kbps / f64::from(speed_kbps) * 100.0;
        ThroughputSummary {
            samples: self.count(),
            min_kbps: self.min(),
            mean_kbps: self.mean(),
            max_kbps: self.max(),
            p50_kbps: self.percentile(50.0),
            mean_saturation_pct: self.mean().map(pct),
        }
    }
}

/// Serializable snapshot of [`ThroughputStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputSummary {
    /// Number of samples.
    pub samples: usize,
    /// Minimum throughput in kbps.
    pub min_kbps: Option<f64>,
    /// Mean throughput in kbps.
    pub mean_kbps: Option<f64>,
    /// Maximum throughput in kbps.
    pub max_kbps: Option<f64>,
    /// Median throughput in kbps.
    pub p50_kbps: Option<f64>,
    /// Mean throughput as a percentage of nominal bus speed.
    pub mean_saturation_pct: Option<f64>,
}
