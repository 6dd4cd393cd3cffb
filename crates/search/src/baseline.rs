//! Reference statistics describing what a "normal" value looks like per channel.
//!
//! Computed from training data when the caller has it, otherwise from the
//! query itself. Clamp and shift edits pull values toward these statistics.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tscf_core::{Result, Series, TscfError};

/// Percentile band used for the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    #[serde(default = "default_lower")]
    pub lower_percentile: f64,
    #[serde(default = "default_upper")]
    pub upper_percentile: f64,
}

fn default_lower() -> f64 { 10.0 }
fn default_upper() -> f64 { 90.0 }

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            lower_percentile: default_lower(),
            upper_percentile: default_upper(),
        }
    }
}

impl BaselineConfig {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = (self.lower_percentile, self.upper_percentile);
        if !(0.0..=100.0).contains(&lo) || !(0.0..=100.0).contains(&hi) || lo > hi {
            return Err(TscfError::InvalidInput(format!(
                "baseline percentiles must satisfy 0 <= lower <= upper <= 100, got {}..{}",
                lo, hi
            )));
        }
        Ok(())
    }
}

/// Normal-range statistics for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelBaseline {
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ChannelBaseline {
    /// Width of the normal band, floored so it can be used as a divisor.
    pub fn spread(&self) -> f64 {
        (self.upper - self.lower).max(f64::EPSILON)
    }

    /// Where a clamp edit should pull `value`: the nearest band edge when
    /// outside the band, the median when inside.
    pub fn target(&self, value: f64) -> f64 {
        if value > self.upper {
            self.upper
        } else if value < self.lower {
            self.lower
        } else {
            self.median
        }
    }

    /// How far `value` sits outside the normal band, in band widths. Values
    /// inside the band score their distance to the median, scaled down so that
    /// any out-of-band value ranks above every in-band one.
    pub fn deviation(&self, value: f64) -> f64 {
        let spread = self.spread();
        if value > self.upper {
            1.0 + (value - self.upper) / spread
        } else if value < self.lower {
            1.0 + (self.lower - value) / spread
        } else {
            ((value - self.median).abs() / spread).min(1.0) * 0.5
        }
    }
}

/// Per-channel baseline keyed by channel name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baseline {
    channels: IndexMap<String, ChannelBaseline>,
}

impl Baseline {
    /// Statistics from a training series (typically much longer than the query).
    pub fn from_training(training: &Series, config: BaselineConfig) -> Result<Self> {
        config.validate()?;
        let channels = training
            .channels()
            .map(|(name, values)| (name.to_string(), channel_stats(values, &config)))
            .collect();
        Ok(Self { channels })
    }

    /// Fallback when no training data is available: use the query itself.
    pub fn from_series(series: &Series, config: BaselineConfig) -> Result<Self> {
        Self::from_training(series, config)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelBaseline> {
        self.channels.get(name)
    }

    /// Baselines in `query`'s channel order. Fails if any channel is missing.
    pub fn aligned_to(&self, query: &Series) -> Result<Vec<ChannelBaseline>> {
        query
            .channel_names()
            .map(|name| {
                self.channels.get(name).copied().ok_or_else(|| {
                    TscfError::InvalidInput(format!(
                        "baseline has no statistics for channel '{}'",
                        name
                    ))
                })
            })
            .collect()
    }
}

fn channel_stats(values: &[f64], config: &BaselineConfig) -> ChannelBaseline {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    ChannelBaseline {
        median: percentile_sorted(&sorted, 50.0),
        lower: percentile_sorted(&sorted, config.lower_percentile),
        upper: percentile_sorted(&sorted, config.upper_percentile),
    }
}

/// Percentile (0–100) with linear interpolation between closest ranks.
///
/// Returns NaN for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, p)
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
