use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TscfError};

/// Mix between proximity (magnitude of change) and sparsity (how many
/// timesteps are touched, and in how many separate runs).
///
/// There is no default: the trade-off is a policy decision of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistanceWeights {
    /// Weight of the normalized magnitude term.
    pub proximity: f64,
    /// Weight of the sparsity term.
    pub sparsity: f64,
    /// Extra sparsity charge per contiguous run of touched timesteps, relative
    /// to one touched timestep. Must lie in `[0, 1]` for the cost to stay
    /// monotone when a new edit bridges two runs.
    #[serde(default = "default_fragmentation")]
    pub fragmentation: f64,
}

fn default_fragmentation() -> f64 { 0.5 }

impl DistanceWeights {
    pub fn new(proximity: f64, sparsity: f64) -> Self {
        Self {
            proximity,
            sparsity,
            fragmentation: default_fragmentation(),
        }
    }

    pub fn with_fragmentation(mut self, fragmentation: f64) -> Self {
        self.fragmentation = fragmentation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("proximity", self.proximity),
            ("sparsity", self.sparsity),
            ("fragmentation", self.fragmentation),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(TscfError::InvalidInput(format!(
                    "distance weight '{}' must be finite and non-negative, got {}",
                    name, w
                )));
            }
        }
        if self.proximity + self.sparsity <= 0.0 {
            return Err(TscfError::InvalidInput(
                "at least one of proximity/sparsity weights must be positive".into(),
            ));
        }
        if self.fragmentation > 1.0 {
            return Err(TscfError::InvalidInput(format!(
                "fragmentation weight must be <= 1.0, got {}",
                self.fragmentation
            )));
        }
        Ok(())
    }
}

/// Norm used for the per-channel magnitude term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MagnitudeNorm {
    #[default]
    L1,
    L2,
}

/// Search configuration, typically parsed from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Cap on search-loop iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Candidates proposed and evaluated per iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// K: iterations looked back for plateau detection.
    #[serde(default = "default_convergence_window")]
    pub convergence_window: usize,
    /// Relative cost improvement over K iterations below which the search converges.
    #[serde(default = "default_convergence_tolerance")]
    pub convergence_tolerance: f64,
    /// Proximity vs sparsity mix. Required.
    pub distance_weights: DistanceWeights,
    #[serde(default)]
    pub magnitude_norm: MagnitudeNorm,
    /// Per-detector-call deadline in milliseconds. None = no deadline.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Cap on detector calls (memo hits excluded). None = unlimited.
    #[serde(default)]
    pub max_detector_calls: Option<usize>,
    /// Wall-clock budget in milliseconds. None = unlimited.
    #[serde(default)]
    pub max_wall_time_ms: Option<u64>,
    /// Evaluation worker threads. 0 = available parallelism.
    #[serde(default)]
    pub worker_threads: usize,
    /// Starting probability that an edit window is drawn at random.
    #[serde(default = "default_initial_exploration")]
    pub initial_exploration: f64,
    /// Per-iteration multiplicative decay of the exploration probability.
    #[serde(default = "default_exploration_decay")]
    pub exploration_decay: f64,
    /// Floor for the exploration probability.
    #[serde(default = "default_min_exploration")]
    pub min_exploration: f64,
    /// Largest edit window as a fraction of the series length.
    #[serde(default = "default_max_window_fraction")]
    pub max_window_fraction: f64,
    /// Upper bound on edits chained into one candidate.
    #[serde(default = "default_max_edits")]
    pub max_edits_per_candidate: usize,
    /// Bisection steps per edited run during final refinement. 0 disables refinement.
    #[serde(default = "default_refine_steps")]
    pub refine_steps: usize,
    /// Memoize detector scores by series fingerprint.
    #[serde(default = "default_memoize")]
    pub memoize: bool,
    /// Maximum memoized scores.
    #[serde(default = "default_memo_capacity")]
    pub memo_capacity: usize,
}

fn default_max_iterations() -> usize { 200 }
fn default_batch_size() -> usize { 8 }
fn default_convergence_window() -> usize { 10 }
fn default_convergence_tolerance() -> f64 { 1e-3 }
fn default_initial_exploration() -> f64 { 0.9 }
fn default_exploration_decay() -> f64 { 0.97 }
fn default_min_exploration() -> f64 { 0.1 }
fn default_max_window_fraction() -> f64 { 0.2 }
fn default_max_edits() -> usize { 4 }
fn default_refine_steps() -> usize { 6 }
fn default_memoize() -> bool { true }
fn default_memo_capacity() -> usize { 4096 }

impl SearchConfig {
    /// Configuration with the given distance weights and defaults elsewhere.
    pub fn new(distance_weights: DistanceWeights) -> Self {
        Self {
            max_iterations: default_max_iterations(),
            batch_size: default_batch_size(),
            convergence_window: default_convergence_window(),
            convergence_tolerance: default_convergence_tolerance(),
            distance_weights,
            magnitude_norm: MagnitudeNorm::default(),
            call_timeout_ms: None,
            max_detector_calls: None,
            max_wall_time_ms: None,
            worker_threads: 0,
            initial_exploration: default_initial_exploration(),
            exploration_decay: default_exploration_decay(),
            min_exploration: default_min_exploration(),
            max_window_fraction: default_max_window_fraction(),
            max_edits_per_candidate: default_max_edits(),
            refine_steps: default_refine_steps(),
            memoize: default_memoize(),
            memo_capacity: default_memo_capacity(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SearchConfig = toml::from_str(s)
            .map_err(|e| TscfError::InvalidInput(format!("search config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.distance_weights.validate()?;

        let positive = [
            ("max_iterations", self.max_iterations),
            ("batch_size", self.batch_size),
            ("convergence_window", self.convergence_window),
            ("max_edits_per_candidate", self.max_edits_per_candidate),
        ];
        for (name, v) in positive {
            if v == 0 {
                return Err(TscfError::InvalidInput(format!("{} must be at least 1", name)));
            }
        }
        if self.memoize && self.memo_capacity == 0 {
            return Err(TscfError::InvalidInput(
                "memo_capacity must be at least 1 when memoize is on".into(),
            ));
        }
        if !self.convergence_tolerance.is_finite() || self.convergence_tolerance < 0.0 {
            return Err(TscfError::InvalidInput(format!(
                "convergence_tolerance must be finite and non-negative, got {}",
                self.convergence_tolerance
            )));
        }

        let probabilities = [
            ("initial_exploration", self.initial_exploration),
            ("exploration_decay", self.exploration_decay),
            ("min_exploration", self.min_exploration),
        ];
        for (name, p) in probabilities {
            if !(0.0..=1.0).contains(&p) {
                return Err(TscfError::InvalidInput(format!(
                    "{} must lie in [0, 1], got {}",
                    name, p
                )));
            }
        }
        if self.min_exploration > self.initial_exploration {
            return Err(TscfError::InvalidInput(
                "min_exploration must not exceed initial_exploration".into(),
            ));
        }
        if !(self.max_window_fraction > 0.0 && self.max_window_fraction <= 1.0) {
            return Err(TscfError::InvalidInput(format!(
                "max_window_fraction must lie in (0, 1], got {}",
                self.max_window_fraction
            )));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(TscfError::InvalidInput("call_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_wall_time(&self) -> Option<Duration> {
        self.max_wall_time_ms.map(Duration::from_millis)
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    /// Largest edit window, in timesteps, for a series of length `len`.
    pub fn max_window_len(&self, len: usize) -> usize {
        ((len as f64 * self.max_window_fraction).ceil() as usize).clamp(1, len.max(1))
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        tracing::info!("Search config:");
        tracing::info!(
            "  budget:      iterations={}, batch={}, calls={}, wall_ms={}",
            self.max_iterations,
            self.batch_size,
            self.max_detector_calls.map_or("unbounded".to_string(), |c| c.to_string()),
            self.max_wall_time_ms.map_or("unbounded".to_string(), |c| c.to_string())
        );
        tracing::info!(
            "  convergence: window={}, tolerance={}",
            self.convergence_window,
            self.convergence_tolerance
        );
        tracing::info!(
            "  distance:    proximity={}, sparsity={}, fragmentation={}, norm={:?}",
            self.distance_weights.proximity,
            self.distance_weights.sparsity,
            self.distance_weights.fragmentation,
            self.magnitude_norm
        );
        tracing::info!(
            "  policy:      explore={}..{} (decay {}), max_window={}, max_edits={}",
            self.initial_exploration,
            self.min_exploration,
            self.exploration_decay,
            self.max_window_fraction,
            self.max_edits_per_candidate
        );
        tracing::info!(
            "  workers:     threads={}, call_timeout_ms={:?}, memoize={}",
            self.resolved_worker_threads(),
            self.call_timeout_ms,
            self.memoize
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> DistanceWeights {
        DistanceWeights::new(1.0, 0.5)
    }

    #[test]
    fn defaults() {
        let config = SearchConfig::new(weights());
        assert_eq!(config.max_iterations, 200);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.convergence_window, 10);
        assert_eq!(config.magnitude_norm, MagnitudeNorm::L1);
        assert!(config.call_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
            max_iterations = 50
            call_timeout_ms = 250

            [distance_weights]
            proximity = 1.0
            sparsity = 2.0
        "#;
        let config = SearchConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.distance_weights.fragmentation, 0.5);
    }

    #[test]
    fn distance_weights_are_required() {
        let err = SearchConfig::from_toml_str("max_iterations = 10").unwrap_err();
        assert!(err.to_string().contains("distance_weights"), "got: {}", err);
    }

    #[test]
    fn parse_norm_lowercase() {
        let toml = r#"
            magnitude_norm = "l2"
            [distance_weights]
            proximity = 1.0
            sparsity = 0.0
        "#;
        let config = SearchConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.magnitude_norm, MagnitudeNorm::L2);
    }

    #[test]
    fn rejects_bad_weights() {
        assert!(DistanceWeights::new(-1.0, 1.0).validate().is_err());
        assert!(DistanceWeights::new(0.0, 0.0).validate().is_err());
        assert!(DistanceWeights::new(1.0, 1.0)
            .with_fragmentation(1.5)
            .validate()
            .is_err());
        assert!(DistanceWeights::new(f64::NAN, 1.0).validate().is_err());
    }

    #[test]
    fn rejects_zero_budgets() {
        let mut config = SearchConfig::new(weights());
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::new(weights());
        config.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::new(weights());
        config.call_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_exploration_bounds() {
        let mut config = SearchConfig::new(weights());
        config.initial_exploration = 0.05;
        config.min_exploration = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolved_worker_threads() {
        let mut config = SearchConfig::new(weights());
        assert!(config.resolved_worker_threads() > 0);
        config.worker_threads = 3;
        assert_eq!(config.resolved_worker_threads(), 3);
    }

    #[test]
    fn max_window_len_bounds() {
        let config = SearchConfig::new(weights());
        assert_eq!(config.max_window_len(150), 30);
        assert_eq!(config.max_window_len(1), 1);
        assert_eq!(config.max_window_len(3), 1);
    }
}
