//! Explanation report assembled from a finished search.

use std::ops::Range;

use serde::Serialize;
use tscf_core::{Result, Series};

use crate::engine::{SearchOutcome, SearchState, TerminationReason};
use crate::generator::Edit;
use crate::metric::{contiguous_runs, touched_mask, CostBreakdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationStatus {
    /// A counterfactual was found and the search converged.
    Converged,
    /// A counterfactual was found but a budget stopped the search first.
    BestEffort,
    /// No valid counterfactual was found within budget.
    NotFound,
}

/// Counterfactual explanation for one query.
///
/// Contains no timing data, so equal inputs and seeds serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explanation {
    pub status: ExplanationStatus,
    pub termination: TerminationReason,
    pub threshold: f64,
    pub original: Series,
    pub original_score: f64,
    pub counterfactual: Option<Series>,
    pub counterfactual_score: Option<f64>,
    /// `counterfactual - original`, channel by channel.
    pub delta: Option<Series>,
    pub cost: Option<CostBreakdown>,
    pub edits: Vec<Edit>,
    pub iterations: usize,
    pub found_at_iteration: Option<usize>,
}

impl Explanation {
    pub fn is_found(&self) -> bool {
        self.counterfactual.is_some()
    }

    /// Maximal runs of timesteps where the counterfactual differs from the original.
    pub fn changed_windows(&self) -> Vec<Range<usize>> {
        match &self.counterfactual {
            Some(cf) => contiguous_runs(&touched_mask(&self.original, cf)),
            None => Vec::new(),
        }
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        match (&self.cost, self.counterfactual_score) {
            (Some(cost), Some(score)) => {
                let windows = self
                    .changed_windows()
                    .iter()
                    .map(|w| format!("{}..{}", w.start, w.end))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "{:?}: score {:.6} -> {:.6} (threshold {}), {} timesteps changed in [{}], cost {:.6}",
                    self.status,
                    self.original_score,
                    score,
                    self.threshold,
                    cost.touched,
                    windows,
                    cost.total
                )
            }
            _ => format!(
                "{:?}: no counterfactual below {} after {} iterations ({:?}), original score {:.6}",
                self.status, self.threshold, self.iterations, self.termination, self.original_score
            ),
        }
    }
}

/// Builds an [`Explanation`] from a [`SearchOutcome`].
pub struct ExplanationBuilder;

impl ExplanationBuilder {
    pub fn build(original: &Series, outcome: &SearchOutcome) -> Result<Explanation> {
        let status = match (&outcome.best, outcome.state) {
            (None, _) => ExplanationStatus::NotFound,
            (Some(_), SearchState::Converged) => ExplanationStatus::Converged,
            (Some(_), SearchState::Exhausted) => ExplanationStatus::BestEffort,
        };

        let mut explanation = Explanation {
            status,
            termination: outcome.termination,
            threshold: outcome.threshold,
            original: original.clone(),
            original_score: outcome.original_score,
            counterfactual: None,
            counterfactual_score: None,
            delta: None,
            cost: None,
            edits: Vec::new(),
            iterations: outcome.stats.iterations,
            found_at_iteration: None,
        };

        if let Some(best) = &outcome.best {
            let cf = best.candidate.series();
            original.check_aligned(cf)?;
            let delta = original
                .channels()
                .zip(cf.channels())
                .map(|((_, o), (_, c))| o.iter().zip(c).map(|(a, b)| b - a).collect())
                .collect();

            explanation.delta = Some(original.with_values(delta)?);
            explanation.counterfactual = Some(cf.clone());
            explanation.counterfactual_score = Some(best.score);
            explanation.cost = Some(best.breakdown);
            explanation.edits = best.candidate.provenance().to_vec();
            explanation.found_at_iteration = Some(best.iteration);
        }
        Ok(explanation)
    }
}
