//! Bootstrap confidence intervals over macroreplications.
//!
//! A bootstrap replicate resamples, with replacement, the per-macroreplication
//! values of every pair and recomputes the statistic of interest. Replicate
//! `b` draws from substream `b` of the allocator's bootstrap stream, so
//! intervals are reproducible and independent of anything else drawn.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::curve::{quantile, Curve};
use crate::error::ValidationError;
use crate::rng::generator::SimRng;
use crate::rng::StreamAllocator;

/// Number of bootstrap replicates and the confidence level of the intervals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSettings {
    /// Bootstrap replicates to draw.
    pub n_bootstraps: usize,
    /// Two-sided confidence level in `(0, 1)`.
    pub conf_level: f64,
}

impl BootstrapSettings {
    /// Settings drawing `n_bootstraps` replicates at `conf_level`.
    #[must_use]
    pub const fn new(n_bootstraps: usize, conf_level: f64) -> Self {
        Self {
            n_bootstraps,
            conf_level,
        }
    }

    /// Checks `n_bootstraps >= 1` and `0 < conf_level < 1`.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.n_bootstraps == 0 {
            return Err(ValidationError::invalid("n_bootstraps", "must be at least 1"));
        }
        if !(self.conf_level > 0.0 && self.conf_level < 1.0) {
            return Err(ValidationError::invalid("conf_level", "must be in (0, 1)"));
        }
        Ok(self)
    }

    /// Quantile levels of the lower and upper bounds.
    #[must_use]
    pub fn tails(&self) -> (f64, f64) {
        let alpha = (1.0 - self.conf_level) / 2.0;
        (alpha, 1.0 - alpha)
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self::new(100, 0.95)
    }
}

/// Percentile interval of a scalar statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Lower percentile bound.
    pub lower: f64,
    /// Upper percentile bound.
    pub upper: f64,
}

impl Interval {
    /// Percentile interval of `replicates`; `None` when there are none.
    #[must_use]
    pub fn from_replicates(replicates: &[f64], settings: &BootstrapSettings) -> Option<Self> {
        let (lo, hi) = settings.tails();
        Some(Self {
            lower: quantile(replicates, lo)?,
            upper: quantile(replicates, hi)?,
        })
    }

    /// Whether `value` lies in the closed interval.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Pointwise percentile band around a curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBand {
    /// Pointwise lower percentile.
    pub lower: Curve,
    /// Pointwise upper percentile.
    pub upper: Curve,
}

impl ConfidenceBand {
    /// Pointwise percentile band of `replicates` on the union of their grids.
    #[must_use]
    pub fn from_replicates(replicates: &[Curve], settings: &BootstrapSettings) -> Option<Self> {
        let (lo, hi) = settings.tails();
        Some(Self {
            lower: Curve::quantile_of(replicates, lo)?,
            upper: Curve::quantile_of(replicates, hi)?,
        })
    }
}

/// Generator of bootstrap replicate `b`.
#[must_use]
pub fn replicate_rng(allocator: StreamAllocator, b: usize) -> SimRng {
    SimRng::new(StreamAllocator::next_stream(allocator.bootstrap_base(), b as u64))
}

/// Draws `values.len()` items from `values` with replacement.
pub fn resample<T: Clone>(values: &[T], rng: &mut SimRng) -> Vec<T> {
    if values.is_empty() {
        return Vec::new();
    }
    (0..values.len())
        .map(|_| values[rng.gen_range(0..values.len())].clone())
        .collect()
}
