//! Search engine: drives generation, evaluation and selection.
//!
//! ```text
//! Init ──► Searching ──► Converged   (plateau, or the original is already normal)
//!   │          │──────► Exhausted   (iteration / call / wall-clock budget, cancel)
//!   └──────────┴──────► Failed      (detector or invariant failure)
//! ```
//!
//! Each iteration proposes up to `batch_size` candidates from the current
//! point (the best valid counterfactual once one exists), scores the ones the
//! memo has not seen on the evaluation pool, and folds the results back in
//! generation order. Selection therefore does not depend on which worker
//! finished first.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tscf_core::{FailureContext, Fingerprint, Result, SearchConfig, Series, TscfError};

use crate::baseline::{Baseline, ChannelBaseline};
use crate::generator::{Candidate, CandidateGenerator, Edit, EditKind, ProposalContext};
use crate::metric::{contiguous_runs, differs, touched_mask, CostBreakdown, DistanceMetric};
use crate::oracle::ValidityOracle;

/// Lifecycle of one search run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchPhase {
    Init,
    Searching,
    Converged,
    Exhausted,
    Failed,
}

/// Terminal state of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    /// Best cost stopped improving (or no search was needed).
    Converged,
    /// A budget ran out or the run was cancelled.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    OriginalAlreadyNormal,
    Plateau,
    IterationBudget,
    CallBudget,
    WallClock,
    Cancelled,
}

/// A valid counterfactual and how it was scored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterfactualResult {
    pub candidate: Candidate,
    pub score: f64,
    pub breakdown: CostBreakdown,
    /// Iteration in which this candidate was accepted (0 = the original).
    pub iteration: usize,
}

impl CounterfactualResult {
    pub fn cost(&self) -> f64 {
        self.candidate.cost()
    }
}

/// Counters collected during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchStats {
    pub iterations: usize,
    /// Detector invocations, including the original and refinement.
    pub detector_calls: usize,
    /// Batches handed to the detector; each holds one or more calls.
    pub detector_batches: usize,
    pub memo_hits: usize,
    pub proposed: usize,
    /// Candidates scored, from the detector or the memo.
    pub evaluated: usize,
    pub valid_seen: usize,
    /// Times the best counterfactual was replaced.
    pub improvements: usize,
    pub refinement_calls: usize,
    /// Best cost after each iteration (`None` until one is found).
    pub best_cost_trace: Vec<Option<f64>>,
    pub elapsed: Duration,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub state: SearchState,
    pub termination: TerminationReason,
    pub threshold: f64,
    pub original_score: f64,
    pub best: Option<CounterfactualResult>,
    pub stats: SearchStats,
}

/// Cooperative cancellation flag, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop. The best counterfactual found so far is kept.
    pub fn cancel(&self) {
        info!("Search cancellation requested");
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Runs counterfactual searches on a dedicated evaluation pool.
pub struct SearchEngine {
    config: SearchConfig,
    pool: rayon::ThreadPool,
    cancel: CancelHandle,
}

impl SearchEngine {
    pub fn new(config: SearchConfig) -> Result<Self> {
        config.validate()?;
        config.log_summary();
        let workers = config.resolved_worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tscf-eval-{}", i))
            .build()
            .map_err(|e| TscfError::Internal(format!("failed to build evaluation pool: {}", e)))?;
        debug!("Evaluation pool ready with {} workers", workers);
        Ok(Self {
            config,
            pool,
            cancel: CancelHandle::new(),
        })
    }

    /// Share an externally owned cancel flag.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Search for a minimal-cost series the oracle accepts.
    ///
    /// All randomness comes from `rng`: the same seed, inputs and a
    /// deterministic detector give the same outcome, whatever the pool size.
    pub fn run<R: Rng + ?Sized>(
        &self,
        original: &Series,
        oracle: &ValidityOracle,
        metric: &DistanceMetric,
        baseline: &Baseline,
        rng: &mut R,
    ) -> Result<SearchOutcome> {
        let mut run = SearchRun {
            engine: self,
            original,
            oracle,
            metric,
            baseline: Vec::new(),
            memo: NonZeroUsize::new(self.config.memo_capacity)
                .filter(|_| self.config.memoize)
                .map(LruCache::new),
            stats: SearchStats::default(),
            started: Instant::now(),
            phase: SearchPhase::Init,
        };
        match run.execute(baseline, rng) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                run.transition(SearchPhase::Failed);
                warn!("Search failed: {}", e);
                Err(e)
            }
        }
    }
}

struct Scored {
    candidate: Candidate,
    score: f64,
    iteration: usize,
}

/// Mutable state of one `run` call.
struct SearchRun<'a> {
    engine: &'a SearchEngine,
    original: &'a Series,
    oracle: &'a ValidityOracle,
    metric: &'a DistanceMetric,
    baseline: Vec<ChannelBaseline>,
    memo: Option<LruCache<Fingerprint, f64>>,
    stats: SearchStats,
    started: Instant,
    phase: SearchPhase,
}

impl<'a> SearchRun<'a> {
    fn execute<R: Rng + ?Sized>(&mut self, baseline: &Baseline, rng: &mut R) -> Result<SearchOutcome> {
        let engine = self.engine;
        let config = &engine.config;
        self.oracle.reference().check_aligned(self.original)?;
        self.baseline = baseline.aligned_to(self.original)?;

        let original = Candidate::original(self.original.clone());
        let original_score = self.evaluate_one(original.clone(), 0)?.score;
        info!(
            "Search starting: {} timesteps x {} channels, original score {:.6} vs threshold {}",
            self.original.len(),
            self.original.num_channels(),
            original_score,
            self.oracle.threshold()
        );

        if self.oracle.is_valid_score(original_score) {
            info!("Original is already below the threshold; nothing to explain");
            self.transition(SearchPhase::Converged);
            let scored = Scored {
                candidate: original,
                score: original_score,
                iteration: 0,
            };
            return self.finish(
                SearchState::Converged,
                TerminationReason::OriginalAlreadyNormal,
                original_score,
                Some(scored),
            );
        }

        self.transition(SearchPhase::Searching);
        let mut generator = CandidateGenerator::new(self.original, config);
        let mut current = Scored {
            candidate: original,
            score: original_score,
            iteration: 0,
        };
        let mut best: Option<Scored> = None;
        let mut exploration = config.initial_exploration;
        let mut iteration = 0;

        let mut termination = loop {
            if let Some(reason) = self.budget_exhausted() {
                break reason;
            }
            if iteration >= config.max_iterations {
                break TerminationReason::IterationBudget;
            }
            iteration += 1;

            let room = self
                .remaining_calls()
                .map_or(config.batch_size, |r| r.min(config.batch_size));
            let anchor = best.as_ref().unwrap_or(&current);
            let ctx = ProposalContext {
                original: self.original,
                baseline: &self.baseline,
                metric: self.metric,
                best: best.as_ref().map(|b| &b.candidate),
                exploration,
            };
            let batch: Vec<Candidate> = generator
                .proposals(&anchor.candidate, &ctx, rng)
                .take(room)
                .collect::<Result<_>>()?;
            self.stats.proposed += batch.len();
            for candidate in &batch {
                check_in_range(candidate, self.original)?;
            }

            let scored = self.evaluate(batch, iteration)?;
            if self.engine.cancel.is_cancelled() {
                debug!("Discarding iteration {} results after cancellation", iteration);
                break TerminationReason::Cancelled;
            }

            for s in scored {
                if self.oracle.is_valid_score(s.score) {
                    self.stats.valid_seen += 1;
                    if best.as_ref().map_or(true, |b| s.candidate.cost() < b.candidate.cost()) {
                        match &best {
                            None => info!(
                                "First counterfactual at iteration {} (cost {:.6}, score {:.6})",
                                iteration,
                                s.candidate.cost(),
                                s.score
                            ),
                            Some(prev) => debug!(
                                "Best cost {:.6} -> {:.6} at iteration {}",
                                prev.candidate.cost(),
                                s.candidate.cost(),
                                iteration
                            ),
                        }
                        self.stats.improvements += 1;
                        best = Some(s);
                    }
                } else if best.is_none() && descends(&current, &s) {
                    current = s;
                }
            }

            self.stats
                .best_cost_trace
                .push(best.as_ref().map(|b| b.candidate.cost()));
            exploration = (exploration * config.exploration_decay).max(config.min_exploration);

            if plateaued(
                &self.stats.best_cost_trace,
                config.convergence_window,
                config.convergence_tolerance,
            ) {
                break TerminationReason::Plateau;
            }
        };
        self.stats.iterations = iteration;

        if let Some(b) = best.as_mut() {
            if termination != TerminationReason::Cancelled && config.refine_steps > 0 {
                // Budgets that run out while refining leave the search's own
                // reason in place; a cancel does not.
                if let Some(TerminationReason::Cancelled) =
                    self.refine(b, &mut generator, iteration)?
                {
                    termination = TerminationReason::Cancelled;
                }
            }
        }

        let state = if termination == TerminationReason::Plateau {
            SearchState::Converged
        } else {
            SearchState::Exhausted
        };
        self.transition(match state {
            SearchState::Converged => SearchPhase::Converged,
            SearchState::Exhausted => SearchPhase::Exhausted,
        });
        info!(
            "Search finished after {} iterations ({:?}): {} detector calls, {} memo hits, best cost {}",
            self.stats.iterations,
            termination,
            self.stats.detector_calls,
            self.stats.memo_hits,
            best.as_ref()
                .map_or_else(|| "none".to_string(), |b| format!("{:.6}", b.candidate.cost()))
        );
        self.finish(state, termination, original_score, best)
    }

    /// Shrink each edited run of `best` toward the original: try a full
    /// revert first, then bisect the blend factor.
    ///
    /// Returns the budget that cut refinement short, if any. A result that
    /// arrives after cancellation is dropped.
    fn refine(
        &mut self,
        best: &mut Scored,
        generator: &mut CandidateGenerator,
        iteration: usize,
    ) -> Result<Option<TerminationReason>> {
        let runs = contiguous_runs(&touched_mask(self.original, best.candidate.series()));
        debug!("Refining {} edited runs of the best counterfactual", runs.len());

        for run in runs {
            let base = best.candidate.clone();
            let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
            let mut alpha = 0.0;
            for step in 0..=self.engine.config.refine_steps {
                if let Some(reason) = self.budget_exhausted() {
                    debug!("Refinement stopped early: {:?}", reason);
                    return Ok(Some(reason));
                }
                let candidate = self.scaled_run(&base, &run, alpha, generator)?;
                let scored = self.evaluate_one(candidate, iteration)?;
                self.stats.refinement_calls += 1;
                if self.engine.cancel.is_cancelled() {
                    debug!("Discarding refinement result after cancellation");
                    return Ok(Some(TerminationReason::Cancelled));
                }

                if self.oracle.is_valid_score(scored.score) {
                    self.stats.valid_seen += 1;
                    if scored.candidate.cost() < best.candidate.cost() {
                        debug!(
                            "Refinement of {}..{} at blend {:.4}: cost {:.6} -> {:.6}",
                            run.start,
                            run.end,
                            alpha,
                            best.candidate.cost(),
                            scored.candidate.cost()
                        );
                        self.stats.improvements += 1;
                        *best = scored;
                    }
                    if step == 0 {
                        break;
                    }
                    hi = alpha;
                } else {
                    lo = alpha;
                }
                alpha = (lo + hi) / 2.0;
            }
        }
        Ok(None)
    }

    /// `base` with the deltas inside `run` scaled by `alpha` (0 = original values).
    fn scaled_run(
        &self,
        base: &Candidate,
        run: &Range<usize>,
        alpha: f64,
        generator: &mut CandidateGenerator,
    ) -> Result<Candidate> {
        let mut values = base.series().to_values();
        let mut provenance = base.provenance().to_vec();
        for (c, (_, original)) in self.original.channels().enumerate() {
            let channel = &mut values[c];
            let mut touched = false;
            for t in run.clone() {
                if differs(original[t], channel[t]) {
                    channel[t] = if alpha == 0.0 {
                        original[t]
                    } else {
                        original[t] + alpha * (channel[t] - original[t])
                    };
                    touched = true;
                }
            }
            if touched {
                provenance.push(Edit {
                    kind: EditKind::Revert,
                    channel: c,
                    start: run.start,
                    end: run.end,
                    magnitude: 1.0 - alpha,
                });
            }
        }
        let series = base.series().with_values(values)?;
        let cost = self.metric.cost(self.original, &series)?;
        Ok(Candidate::new(generator.allocate_generation(), series, provenance, cost))
    }

    fn evaluate_one(&mut self, candidate: Candidate, iteration: usize) -> Result<Scored> {
        self.evaluate(vec![candidate], iteration)?
            .pop()
            .ok_or_else(|| TscfError::Internal("evaluation returned no score".into()))
    }

    /// Score a batch, consulting the memo first. Results keep batch order.
    ///
    /// Memo misses are split into one contiguous group per worker and each
    /// group goes to the detector as a single batch. A failing group is
    /// reported against its lowest generation.
    fn evaluate(&mut self, batch: Vec<Candidate>, iteration: usize) -> Result<Vec<Scored>> {
        let mut scores: Vec<Option<f64>> = vec![None; batch.len()];
        let mut pending: Vec<(usize, Option<Fingerprint>)> = Vec::new();
        for (i, candidate) in batch.iter().enumerate() {
            match self.memo.as_mut() {
                Some(memo) => {
                    let fp = candidate.series().fingerprint();
                    match memo.get(&fp) {
                        Some(score) => {
                            scores[i] = Some(*score);
                            self.stats.memo_hits += 1;
                        }
                        None => pending.push((i, Some(fp))),
                    }
                }
                None => pending.push((i, None)),
            }
        }

        // Contiguous groups, one detector batch per worker.
        let workers = self.engine.pool.current_num_threads().max(1);
        let group_len = pending.len().div_ceil(workers).max(1);
        let oracle = self.oracle;
        let candidates = &batch;
        let mut results: Vec<(u64, &[(usize, Option<Fingerprint>)], Result<Vec<f64>>)> =
            self.engine.pool.install(|| {
                pending
                    .par_chunks(group_len)
                    .map(|group| {
                        let series: Vec<Series> = group
                            .iter()
                            .map(|&(i, _)| candidates[i].series().clone())
                            .collect();
                        let first = group
                            .iter()
                            .map(|&(i, _)| candidates[i].generation())
                            .min()
                            .unwrap_or_default();
                        (first, group, oracle.evaluate_batch(&series))
                    })
                    .collect()
            });
        results.sort_by_key(|(first, ..)| *first);
        self.stats.detector_calls += pending.len();
        self.stats.detector_batches += results.len();
        self.stats.evaluated += batch.len();

        for (first, group, result) in results {
            match result {
                Ok(group_scores) => {
                    for (&(i, fp), score) in group.iter().zip(group_scores) {
                        scores[i] = Some(score);
                        if let (Some(memo), Some(fp)) = (self.memo.as_mut(), fp) {
                            memo.put(fp, score);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Detector failed on a batch of {} from candidate #{} in iteration {}: {}",
                        group.len(),
                        first,
                        iteration,
                        e
                    );
                    return Err(e.with_context(FailureContext {
                        iteration,
                        generation: first,
                    }));
                }
            }
        }

        batch
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| {
                let score = score.ok_or_else(|| {
                    TscfError::Internal(format!("candidate #{} left unscored", candidate.generation()))
                })?;
                Ok(Scored {
                    candidate,
                    score,
                    iteration,
                })
            })
            .collect()
    }

    fn budget_exhausted(&self) -> Option<TerminationReason> {
        let config = &self.engine.config;
        if self.engine.cancel.is_cancelled() {
            return Some(TerminationReason::Cancelled);
        }
        if matches!(config.max_detector_calls, Some(max) if self.stats.detector_calls >= max) {
            return Some(TerminationReason::CallBudget);
        }
        if matches!(config.max_wall_time(), Some(limit) if self.started.elapsed() >= limit) {
            return Some(TerminationReason::WallClock);
        }
        None
    }

    fn remaining_calls(&self) -> Option<usize> {
        self.engine
            .config
            .max_detector_calls
            .map(|max| max.saturating_sub(self.stats.detector_calls))
    }

    fn transition(&mut self, to: SearchPhase) {
        debug!("Search phase {:?} -> {:?}", self.phase, to);
        self.phase = to;
    }

    fn finish(
        &mut self,
        state: SearchState,
        termination: TerminationReason,
        original_score: f64,
        best: Option<Scored>,
    ) -> Result<SearchOutcome> {
        self.stats.elapsed = self.started.elapsed();
        let best = match best {
            Some(s) => Some(CounterfactualResult {
                breakdown: self.metric.breakdown(self.original, s.candidate.series())?,
                candidate: s.candidate,
                score: s.score,
                iteration: s.iteration,
            }),
            None => None,
        };
        Ok(SearchOutcome {
            state,
            termination,
            threshold: self.oracle.threshold(),
            original_score,
            best,
            stats: self.stats.clone(),
        })
    }
}

/// Before any valid candidate exists, follow the score down (cost breaks ties).
fn descends(current: &Scored, next: &Scored) -> bool {
    next.score < current.score
        || (next.score == current.score && next.candidate.cost() < current.candidate.cost())
}

/// Every edit must address a real channel and stay inside the series.
fn check_in_range(candidate: &Candidate, original: &Series) -> Result<()> {
    for edit in candidate.provenance() {
        if !edit.is_within(original.len(), original.num_channels()) {
            return Err(TscfError::InternalInvariant(format!(
                "candidate #{} carries {:?} outside {} channels x {} timesteps",
                candidate.generation(),
                edit,
                original.num_channels(),
                original.len()
            )));
        }
    }
    Ok(())
}

/// True once the best cost improved by less than `tolerance` (relative)
/// over the last `window` iterations.
fn plateaued(trace: &[Option<f64>], window: usize, tolerance: f64) -> bool {
    if trace.len() <= window {
        return false;
    }
    let (Some(then), Some(now)) = (trace[trace.len() - 1 - window], trace[trace.len() - 1]) else {
        return false;
    };
    if then <= f64::EPSILON {
        return true;
    }
    (then - now) / then < tolerance
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::DateTime;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tscf_core::{DetectorFault, DistanceWeights, MagnitudeNorm};

    use super::*;
    use crate::baseline::BaselineConfig;
    use crate::oracle::{detector_fn, Detector};

    fn series(values: Vec<f64>) -> Series {
        let ts = (0..values.len() as i64)
            .map(|i| DateTime::from_timestamp(i, 0).unwrap())
            .collect();
        Series::univariate(ts, "v", values).unwrap()
    }

    fn spiky() -> Series {
        let mut v = vec![0.3; 60];
        for x in &mut v[30..34] {
            *x = 2.0;
        }
        series(v)
    }

    /// Fraction of points above 1.0.
    fn exceedance() -> Arc<dyn Detector> {
        Arc::new(detector_fn(|s: &Series| {
            let v = s.channel_at(0).unwrap();
            v.iter().filter(|x| **x > 1.0).count() as f64 / v.len() as f64
        }))
    }

    fn config() -> SearchConfig {
        let mut c = SearchConfig::new(DistanceWeights::new(1.0, 1.0));
        c.max_iterations = 60;
        c.worker_threads = 2;
        c
    }

    fn run_with(
        original: &Series,
        detector: Arc<dyn Detector>,
        config: SearchConfig,
        seed: u64,
    ) -> Result<SearchOutcome> {
        let oracle = ValidityOracle::new(detector, 0.001, original)?;
        let metric = DistanceMetric::new(original, config.distance_weights, MagnitudeNorm::L1)?;
        let baseline = Baseline::from_series(original, BaselineConfig::default())?;
        let engine = SearchEngine::new(config)?;
        engine.run(original, &oracle, &metric, &baseline, &mut ChaCha8Rng::seed_from_u64(seed))
    }

    #[test]
    fn finds_a_valid_counterfactual() {
        let original = spiky();
        let outcome = run_with(&original, exceedance(), config(), 11).unwrap();
        let best = outcome.best.expect("a counterfactual");
        assert!(best.score < 0.001);
        assert!(best.cost() > 0.0);
        assert_eq!(best.breakdown.total, best.cost());
        assert!(outcome.stats.detector_calls >= 2);
        assert_eq!(outcome.original_score, 4.0 / 60.0);
    }

    #[test]
    fn normal_original_needs_no_search() {
        let original = series(vec![0.1; 20]);
        let outcome = run_with(&original, exceedance(), config(), 1).unwrap();
        assert_eq!(outcome.state, SearchState::Converged);
        assert_eq!(outcome.termination, TerminationReason::OriginalAlreadyNormal);
        let best = outcome.best.unwrap();
        assert_eq!(best.cost(), 0.0);
        assert_eq!(best.candidate.generation(), 0);
        assert_eq!(outcome.stats.detector_calls, 1);
    }

    #[test]
    fn call_budget_is_respected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let det: Arc<dyn Detector> = Arc::new(detector_fn(move |_: &Series| {
            seen.fetch_add(1, Ordering::SeqCst);
            1.0
        }));
        let mut cfg = config();
        cfg.max_detector_calls = Some(13);
        cfg.memoize = false;
        let outcome = run_with(&spiky(), det, cfg, 2).unwrap();
        assert_eq!(outcome.termination, TerminationReason::CallBudget);
        assert_eq!(outcome.state, SearchState::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 13);
        assert_eq!(outcome.stats.detector_calls, 13);
    }

    #[test]
    fn failures_carry_iteration_and_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let det: Arc<dyn Detector> = Arc::new(crate::oracle::try_detector_fn(
            move |_: &Series| {
                if seen.fetch_add(1, Ordering::SeqCst) == 2 {
                    Err("model unavailable".to_string())
                } else {
                    Ok(1.0)
                }
            },
        ));
        let mut cfg = config();
        cfg.batch_size = 1;
        cfg.worker_threads = 1;
        cfg.memoize = false;
        let err = run_with(&spiky(), det, cfg, 3).unwrap_err();
        assert_eq!(
            err.detector_fault(),
            Some(&DetectorFault::Raised("model unavailable".into()))
        );
        assert_eq!(
            err.failure_context(),
            Some(FailureContext {
                iteration: 2,
                generation: 2
            })
        );
    }

    #[test]
    fn cancelled_before_start() {
        let original = spiky();
        let oracle = ValidityOracle::new(exceedance(), 0.001, &original).unwrap();
        let metric =
            DistanceMetric::new(&original, DistanceWeights::new(1.0, 1.0), MagnitudeNorm::L1)
                .unwrap();
        let baseline = Baseline::from_series(&original, BaselineConfig::default()).unwrap();
        let engine = SearchEngine::new(config()).unwrap();
        engine.cancel_handle().cancel();
        let outcome = engine
            .run(&original, &oracle, &metric, &baseline, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();
        assert_eq!(outcome.termination, TerminationReason::Cancelled);
        assert_eq!(outcome.state, SearchState::Exhausted);
        assert!(outcome.best.is_none());
        assert_eq!(outcome.stats.iterations, 0);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut cfg = config();
        cfg.batch_size = 0;
        assert!(matches!(SearchEngine::new(cfg), Err(TscfError::InvalidInput(_))));
    }

    #[test]
    fn plateau_detection() {
        assert!(!plateaued(&[None, None, None], 2, 1e-3));
        assert!(!plateaued(&[Some(1.0), Some(0.5)], 2, 1e-3));
        assert!(plateaued(&[Some(1.0), Some(1.0), Some(1.0)], 2, 1e-3));
        assert!(!plateaued(&[Some(1.0), Some(0.9), Some(0.8)], 2, 1e-3));
        assert!(!plateaued(&[None, Some(1.0), Some(1.0)], 2, 1e-3));
    }

    #[test]
    fn refinement_reverts_unneeded_runs() {
        // Only the spike at 30..34 matters; a second edit at 5..8 is pure cost.
        let original = spiky();
        let mut values = original.to_values();
        for t in 30..34 {
            values[0][t] = 0.3;
        }
        for t in 5..8 {
            values[0][t] = 0.0;
        }
        let edited = original.with_values(values).unwrap();

        let oracle = ValidityOracle::new(exceedance(), 0.001, &original).unwrap();
        let metric =
            DistanceMetric::new(&original, DistanceWeights::new(1.0, 1.0), MagnitudeNorm::L1)
                .unwrap();
        let engine = SearchEngine::new(config()).unwrap();
        let mut run = SearchRun {
            engine: &engine,
            original: &original,
            oracle: &oracle,
            metric: &metric,
            baseline: Vec::new(),
            memo: None,
            stats: SearchStats::default(),
            started: Instant::now(),
            phase: SearchPhase::Searching,
        };
        let cost = metric.cost(&original, &edited).unwrap();
        let mut best = Scored {
            candidate: Candidate::new(1, edited, Vec::new(), cost),
            score: 0.0,
            iteration: 1,
        };
        let mut generator = CandidateGenerator::new(&original, engine.config());
        generator.allocate_generation();
        assert_eq!(run.refine(&mut best, &mut generator, 1).unwrap(), None);

        let mask = touched_mask(&original, best.candidate.series());
        assert!(!mask[5..8].iter().any(|t| *t), "harmless edit should be reverted");
        assert!(mask[30..34].iter().all(|t| *t), "needed edit must stay");
        assert!(best.candidate.cost() < cost);
        assert!(best.candidate.generation() > 1);
    }

    #[test]
    fn detector_sees_whole_batches() {
        let widest = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&widest);
        let det: Arc<dyn Detector> = Arc::new(crate::oracle::batch_detector_fn(
            move |b: &[Series]| {
                seen.fetch_max(b.len(), Ordering::SeqCst);
                vec![1.0; b.len()]
            },
        ));
        let mut cfg = config();
        cfg.batch_size = 8;
        cfg.max_iterations = 5;
        cfg.worker_threads = 1;
        cfg.memoize = false;
        let outcome = run_with(&spiky(), det, cfg, 4).unwrap();
        assert_eq!(widest.load(Ordering::SeqCst), 8);
        assert_eq!(outcome.stats.detector_calls, 1 + 5 * 8);
        assert_eq!(outcome.stats.detector_batches, 1 + 5);
    }

    #[test]
    fn batches_split_across_workers() {
        let widest = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&widest);
        let det: Arc<dyn Detector> = Arc::new(crate::oracle::batch_detector_fn(
            move |b: &[Series]| {
                seen.fetch_max(b.len(), Ordering::SeqCst);
                vec![1.0; b.len()]
            },
        ));
        let mut cfg = config();
        cfg.batch_size = 8;
        cfg.max_iterations = 3;
        cfg.memoize = false;
        let outcome = run_with(&spiky(), det, cfg, 4).unwrap();
        assert_eq!(widest.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.stats.detector_batches, 1 + 3 * 2);
    }

    #[test]
    fn cancel_during_refinement_drops_the_late_result() {
        let original = spiky();
        let mut values = original.to_values();
        for t in 28..36 {
            values[0][t] = 0.3;
        }
        let edited = original.with_values(values).unwrap();

        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let det: Arc<dyn Detector> = Arc::new(detector_fn(move |_: &Series| {
            trigger.cancel();
            0.0
        }));
        let oracle = ValidityOracle::new(det, 0.001, &original).unwrap();
        let metric =
            DistanceMetric::new(&original, DistanceWeights::new(1.0, 1.0), MagnitudeNorm::L1)
                .unwrap();
        let engine = SearchEngine::new(config()).unwrap().with_cancel_handle(cancel);
        let mut run = SearchRun {
            engine: &engine,
            original: &original,
            oracle: &oracle,
            metric: &metric,
            baseline: Vec::new(),
            memo: None,
            stats: SearchStats::default(),
            started: Instant::now(),
            phase: SearchPhase::Searching,
        };
        let cost = metric.cost(&original, &edited).unwrap();
        let mut best = Scored {
            candidate: Candidate::new(1, edited, Vec::new(), cost),
            score: 0.0,
            iteration: 1,
        };
        let mut generator = CandidateGenerator::new(&original, engine.config());
        generator.allocate_generation();

        let stopped = run.refine(&mut best, &mut generator, 1).unwrap();
        assert_eq!(stopped, Some(TerminationReason::Cancelled));
        assert_eq!(run.stats.refinement_calls, 1);
        assert_eq!(best.candidate.generation(), 1);
        assert_eq!(best.candidate.cost(), cost);
    }

    #[test]
    fn cancel_during_refinement_is_reported() {
        let original = series((0..60).map(|t| (t as f64 * 0.3).sin() + 2.0).collect());
        let reference = original.to_values();
        let (batch_size, iterations) = (4, 5);
        let search_calls = 1 + batch_size * iterations;

        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let det: Arc<dyn Detector> = Arc::new(detector_fn(move |s: &Series| {
            if seen.fetch_add(1, Ordering::SeqCst) >= search_calls {
                trigger.cancel();
            }
            if s.to_values() == reference {
                1.0
            } else {
                0.0
            }
        }));

        let mut cfg = config();
        cfg.batch_size = batch_size;
        cfg.max_iterations = iterations;
        cfg.convergence_window = 50;
        cfg.worker_threads = 1;
        cfg.memoize = false;
        let oracle = ValidityOracle::new(det, 0.001, &original).unwrap();
        let metric =
            DistanceMetric::new(&original, DistanceWeights::new(1.0, 1.0), MagnitudeNorm::L1)
                .unwrap();
        let baseline = Baseline::from_series(&original, BaselineConfig::default()).unwrap();
        let engine = SearchEngine::new(cfg).unwrap().with_cancel_handle(cancel);
        let outcome = engine
            .run(&original, &oracle, &metric, &baseline, &mut ChaCha8Rng::seed_from_u64(9))
            .unwrap();

        assert_eq!(outcome.termination, TerminationReason::Cancelled);
        assert_eq!(outcome.state, SearchState::Exhausted);
        assert_eq!(outcome.stats.refinement_calls, 1);
        let best = outcome.best.expect("found during the search");
        assert!(best.iteration <= iterations);
        assert!(best.candidate.generation() <= (batch_size * iterations) as u64);
    }

    #[test]
    fn out_of_range_edits_break_the_invariant() {
        let original = spiky();
        let past_end = Candidate::new(
            1,
            original.clone(),
            vec![Edit {
                kind: EditKind::PointMask,
                channel: 0,
                start: 58,
                end: 61,
                magnitude: 1.0,
            }],
            0.0,
        );
        assert!(matches!(
            check_in_range(&past_end, &original),
            Err(TscfError::InternalInvariant(_))
        ));

        let no_such_channel = Candidate::new(
            2,
            original.clone(),
            vec![Edit {
                kind: EditKind::ClampTowardBaseline,
                channel: 1,
                start: 0,
                end: 4,
                magnitude: 1.0,
            }],
            0.0,
        );
        assert!(matches!(
            check_in_range(&no_such_channel, &original),
            Err(TscfError::InternalInvariant(_))
        ));

        let inside = Candidate::new(
            3,
            original.clone(),
            vec![Edit {
                kind: EditKind::PointMask,
                channel: 0,
                start: 30,
                end: 34,
                magnitude: 1.0,
            }],
            0.0,
        );
        assert!(check_in_range(&inside, &original).is_ok());
    }
}
