//! Distance & sparsity cost of a candidate relative to the original series.
//!
//! cost = proximity * magnitude + sparsity * (touched + fragmentation * runs) / len
//!
//! - magnitude: per-channel normalized L1 (mean |delta| / scale) or L2
//!   (RMS delta / scale), summed over channels
//! - touched: timesteps where any channel differs from the original
//! - runs: maximal contiguous runs of touched timesteps
//!
//! With `fragmentation <= 1` touching one more timestep never lowers the cost,
//! even when it bridges two runs.

use std::ops::Range;

use serde::Serialize;
use tscf_core::{DistanceWeights, MagnitudeNorm, Result, Series};

/// Relative tolerance below which a value counts as unchanged.
const TOUCH_EPSILON: f64 = 1e-12;

/// Cost components, kept for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub magnitude: f64,
    pub touched: usize,
    pub runs: usize,
    pub sparsity: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub const ZERO: CostBreakdown = CostBreakdown {
        magnitude: 0.0,
        touched: 0,
        runs: 0,
        sparsity: 0.0,
        total: 0.0,
    };
}

/// Weighted proximity + sparsity metric, normalized against one original series.
#[derive(Debug, Clone)]
pub struct DistanceMetric {
    weights: DistanceWeights,
    norm: MagnitudeNorm,
    /// Per-channel scale (value range of the original, 1.0 when flat).
    scales: Vec<f64>,
}

impl DistanceMetric {
    pub fn new(original: &Series, weights: DistanceWeights, norm: MagnitudeNorm) -> Result<Self> {
        weights.validate()?;
        let scales = original.channels().map(|(_, v)| channel_scale(v)).collect();
        Ok(Self {
            weights,
            norm,
            scales,
        })
    }

    pub fn weights(&self) -> &DistanceWeights {
        &self.weights
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    /// Scalar cost of `candidate` against `original`. `cost(s, s) == 0`.
    pub fn cost(&self, original: &Series, candidate: &Series) -> Result<f64> {
        Ok(self.breakdown(original, candidate)?.total)
    }

    pub fn breakdown(&self, original: &Series, candidate: &Series) -> Result<CostBreakdown> {
        original.check_aligned(candidate)?;
        let len = original.len() as f64;

        let mut magnitude = 0.0;
        for (c, ((_, o), (_, v))) in original.channels().zip(candidate.channels()).enumerate() {
            let scale = self.scales.get(c).copied().unwrap_or(1.0);
            magnitude += match self.norm {
                MagnitudeNorm::L1 => {
                    o.iter().zip(v).map(|(a, b)| (b - a).abs()).sum::<f64>() / (scale * len)
                }
                MagnitudeNorm::L2 => {
                    (o.iter().zip(v).map(|(a, b)| (b - a).powi(2)).sum::<f64>() / len).sqrt()
                        / scale
                }
            };
        }

        let mask = touched_mask(original, candidate);
        let touched = mask.iter().filter(|t| **t).count();
        let runs = contiguous_runs(&mask).len();
        if touched == 0 {
            return Ok(CostBreakdown::ZERO);
        }

        let sparsity = (touched as f64 + self.weights.fragmentation * runs as f64) / len;
        let total = self.weights.proximity * magnitude + self.weights.sparsity * sparsity;

        Ok(CostBreakdown {
            magnitude,
            touched,
            runs,
            sparsity,
            total,
        })
    }
}

fn channel_scale(values: &[f64]) -> f64 {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = hi - lo;
    if range > f64::EPSILON {
        range
    } else {
        1.0
    }
}

/// Whether two values differ beyond rounding noise.
pub(crate) fn differs(a: f64, b: f64) -> bool {
    (a - b).abs() > TOUCH_EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Per-timestep flag: does any channel of `candidate` differ from `original`?
///
/// Both series must be aligned; extra positions are ignored.
pub fn touched_mask(original: &Series, candidate: &Series) -> Vec<bool> {
    let mut mask = vec![false; original.len()];
    for ((_, o), (_, v)) in original.channels().zip(candidate.channels()) {
        for (t, (a, b)) in o.iter().zip(v).enumerate() {
            if differs(*a, *b) {
                mask[t] = true;
            }
        }
    }
    mask
}

/// Maximal contiguous runs of `true` in `mask`, in index order.
pub fn contiguous_runs(mask: &[bool]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &on) in mask.iter().enumerate() {
        match (on, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..mask.len());
    }
    runs
}
