//! One-call facade: detector + threshold + config in, explanation out.

use std::sync::Arc;

use rand::Rng;
use tracing::info;
use tscf_core::{Result, SearchConfig, Series, TscfError};

use crate::baseline::{Baseline, BaselineConfig};
use crate::engine::{CancelHandle, SearchEngine, SearchOutcome};
use crate::explanation::{Explanation, ExplanationBuilder};
use crate::metric::DistanceMetric;
use crate::oracle::{Detector, ValidityOracle};

/// Explains why a detector flags a series by searching for a nearby series it does not flag.
///
/// The explainer is reusable across queries; each call builds a fresh
/// oracle, metric and engine for the query at hand. Cancellation is per
/// query: pass a [`CancelHandle`] to the `*_with_cancel` variants.
pub struct Explainer {
    detector: Arc<dyn Detector>,
    threshold: f64,
    config: SearchConfig,
    baseline_config: BaselineConfig,
    training: Option<Baseline>,
}

impl Explainer {
    pub fn new<D: Detector + 'static>(detector: D, threshold: f64, config: SearchConfig) -> Result<Self> {
        Self::from_arc(Arc::new(detector), threshold, config)
    }

    pub fn from_arc(detector: Arc<dyn Detector>, threshold: f64, config: SearchConfig) -> Result<Self> {
        if !threshold.is_finite() {
            return Err(TscfError::InvalidInput(format!(
                "threshold must be finite, got {}",
                threshold
            )));
        }
        config.validate()?;
        Ok(Self {
            detector,
            threshold,
            config,
            baseline_config: BaselineConfig::default(),
            training: None,
        })
    }

    /// Percentile band for baselines. Set before [`with_training_data`](Self::with_training_data).
    pub fn with_baseline_config(mut self, baseline_config: BaselineConfig) -> Result<Self> {
        baseline_config.validate()?;
        self.baseline_config = baseline_config;
        Ok(self)
    }

    /// Derive the normal-range baseline from training data instead of the query.
    pub fn with_training_data(mut self, training: &Series) -> Result<Self> {
        let baseline = Baseline::from_training(training, self.baseline_config)?;
        info!(
            "Baseline computed from {} training timesteps over {} channels",
            training.len(),
            training.num_channels()
        );
        self.training = Some(baseline);
        Ok(self)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Search for a counterfactual of `query` and report it.
    pub fn explain<R: Rng + ?Sized>(&self, query: &Series, rng: &mut R) -> Result<Explanation> {
        self.explain_with_cancel(query, &CancelHandle::new(), rng)
    }

    /// [`explain`](Self::explain), stopping early once `cancel` fires.
    pub fn explain_with_cancel<R: Rng + ?Sized>(
        &self,
        query: &Series,
        cancel: &CancelHandle,
        rng: &mut R,
    ) -> Result<Explanation> {
        let outcome = self.search_with_cancel(query, cancel, rng)?;
        ExplanationBuilder::build(query, &outcome)
    }

    /// Like [`explain`](Self::explain) but returns the raw outcome with run statistics.
    pub fn search<R: Rng + ?Sized>(&self, query: &Series, rng: &mut R) -> Result<SearchOutcome> {
        self.search_with_cancel(query, &CancelHandle::new(), rng)
    }

    /// [`search`](Self::search) under a caller-owned cancel handle.
    ///
    /// The handle only affects this query. A handle that is already
    /// cancelled ends the search before its first iteration.
    pub fn search_with_cancel<R: Rng + ?Sized>(
        &self,
        query: &Series,
        cancel: &CancelHandle,
        rng: &mut R,
    ) -> Result<SearchOutcome> {
        let oracle = ValidityOracle::new(Arc::clone(&self.detector), self.threshold, query)?
            .with_call_timeout(self.config.call_timeout());
        let metric = DistanceMetric::new(query, self.config.distance_weights, self.config.magnitude_norm)?;
        let from_query;
        let baseline = match &self.training {
            Some(b) => b,
            None => {
                from_query = Baseline::from_series(query, self.baseline_config)?;
                &from_query
            }
        };
        let engine = SearchEngine::new(self.config.clone())?.with_cancel_handle(cancel.clone());
        engine.run(query, &oracle, &metric, baseline, rng)
    }
}
