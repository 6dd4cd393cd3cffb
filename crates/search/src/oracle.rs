//! Validity oracle: wraps the caller's detector and the decision threshold.
//!
//! Any type implementing [`Detector`] can back the oracle. Closures are
//! adapted with [`detector_fn`], [`try_detector_fn`] and [`batch_detector_fn`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use tscf_core::{DetectorFault, Result, Series, TscfError};

/// Opaque scoring function. Lower scores are more normal.
///
/// Implementations are called concurrently from evaluation workers.
pub trait Detector: Send + Sync {
    /// Score one series.
    fn score(&self, series: &Series) -> std::result::Result<f64, DetectorFault>;

    /// Score several series, one score per input in order.
    fn score_batch(&self, batch: &[Series]) -> std::result::Result<Vec<f64>, DetectorFault> {
        batch.iter().map(|s| self.score(s)).collect()
    }
}

/// Detector backed by an infallible `Fn(&Series) -> f64`.
pub struct FnDetector<F>(F);

impl<F> Detector for FnDetector<F>
where
    F: Fn(&Series) -> f64 + Send + Sync,
{
    fn score(&self, series: &Series) -> std::result::Result<f64, DetectorFault> {
        Ok((self.0)(series))
    }
}

/// Detector backed by a fallible `Fn(&Series) -> Result<f64, String>`.
pub struct TryFnDetector<F>(F);

impl<F> Detector for TryFnDetector<F>
where
    F: Fn(&Series) -> std::result::Result<f64, String> + Send + Sync,
{
    fn score(&self, series: &Series) -> std::result::Result<f64, DetectorFault> {
        (self.0)(series).map_err(DetectorFault::Raised)
    }
}

/// Detector backed by a vectorised `Fn(&[Series]) -> Vec<f64>`.
pub struct BatchFnDetector<F>(F);

impl<F> Detector for BatchFnDetector<F>
where
    F: Fn(&[Series]) -> Vec<f64> + Send + Sync,
{
    fn score(&self, series: &Series) -> std::result::Result<f64, DetectorFault> {
        let scores = self.score_batch(std::slice::from_ref(series))?;
        Ok(scores[0])
    }

    fn score_batch(&self, batch: &[Series]) -> std::result::Result<Vec<f64>, DetectorFault> {
        let scores = (self.0)(batch);
        if scores.len() != batch.len() {
            return Err(DetectorFault::BatchSize {
                expected: batch.len(),
                actual: scores.len(),
            });
        }
        Ok(scores)
    }
}

pub fn detector_fn<F>(f: F) -> FnDetector<F>
where
    F: Fn(&Series) -> f64 + Send + Sync,
{
    FnDetector(f)
}

pub fn try_detector_fn<F>(f: F) -> TryFnDetector<F>
where
    F: Fn(&Series) -> std::result::Result<f64, String> + Send + Sync,
{
    TryFnDetector(f)
}

pub fn batch_detector_fn<F>(f: F) -> BatchFnDetector<F>
where
    F: Fn(&[Series]) -> Vec<f64> + Send + Sync,
{
    BatchFnDetector(f)
}

/// Answers "is this candidate a valid counterfactual?" (`score < threshold`).
///
/// Every call goes to the detector; memoization is the engine's job.
pub struct ValidityOracle {
    detector: Arc<dyn Detector>,
    threshold: f64,
    reference: Series,
    call_timeout: Option<Duration>,
    calls: AtomicUsize,
}

impl ValidityOracle {
    /// Create an oracle for candidates shaped like `reference`.
    pub fn new(detector: Arc<dyn Detector>, threshold: f64, reference: &Series) -> Result<Self> {
        if !threshold.is_finite() {
            return Err(TscfError::InvalidInput(format!(
                "threshold must be finite, got {}",
                threshold
            )));
        }
        Ok(Self {
            detector,
            threshold,
            reference: reference.clone(),
            call_timeout: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Convert detector calls running longer than `timeout` into failures.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The series every candidate must be aligned with.
    pub fn reference(&self) -> &Series {
        &self.reference
    }

    /// Total detector invocations made through this oracle.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn is_valid_score(&self, score: f64) -> bool {
        score < self.threshold
    }

    /// Raw detector score of `series`.
    pub fn evaluate(&self, series: &Series) -> Result<f64> {
        self.reference.check_aligned(series)?;
        self.calls.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.call_timeout {
            None => guarded(self.detector.as_ref(), |d| d.score(series)),
            Some(limit) => {
                let owned = series.clone();
                self.call_with_deadline(limit, move |d| d.score(&owned))
            }
        };
        outcome.and_then(finite).map_err(TscfError::detector)
    }

    /// Raw detector scores of `batch`, in order, from a single
    /// [`Detector::score_batch`] call.
    ///
    /// The call timeout applies to the batch as a whole. Every series counts
    /// as one call towards [`calls`](Self::calls).
    pub fn evaluate_batch(&self, batch: &[Series]) -> Result<Vec<f64>> {
        for series in batch {
            self.reference.check_aligned(series)?;
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.calls.fetch_add(batch.len(), Ordering::Relaxed);

        let outcome = match self.call_timeout {
            None => guarded(self.detector.as_ref(), |d| d.score_batch(batch)),
            Some(limit) => {
                let owned = batch.to_vec();
                self.call_with_deadline(limit, move |d| d.score_batch(&owned))
            }
        };
        let scores = outcome.map_err(TscfError::detector)?;
        if scores.len() != batch.len() {
            return Err(TscfError::detector(DetectorFault::BatchSize {
                expected: batch.len(),
                actual: scores.len(),
            }));
        }
        for score in &scores {
            finite(*score).map_err(TscfError::detector)?;
        }
        Ok(scores)
    }

    pub fn is_valid(&self, series: &Series) -> Result<bool> {
        Ok(self.is_valid_score(self.evaluate(series)?))
    }

    /// Run the call on its own thread and stop waiting after `limit`.
    /// A call that overruns is abandoned, not killed; its late result is dropped.
    fn call_with_deadline<T, F>(
        &self,
        limit: Duration,
        call: F,
    ) -> std::result::Result<T, DetectorFault>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Detector) -> std::result::Result<T, DetectorFault> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let detector = Arc::clone(&self.detector);

        std::thread::Builder::new()
            .name("tscf-detector-call".into())
            .spawn(move || {
                let _ = tx.send(guarded(detector.as_ref(), call));
            })
            .map_err(|e| DetectorFault::Raised(format!("failed to spawn detector call: {}", e)))?;

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Detector call exceeded {:?}; abandoning it", limit);
                Err(DetectorFault::Timeout(limit))
            }
            Err(RecvTimeoutError::Disconnected) => Err(DetectorFault::Raised(
                "detector call ended without producing a score".into(),
            )),
        }
    }
}

/// Call the detector, turning panics into faults.
fn guarded<T, F>(detector: &dyn Detector, call: F) -> std::result::Result<T, DetectorFault>
where
    F: FnOnce(&dyn Detector) -> std::result::Result<T, DetectorFault>,
{
    panic::catch_unwind(AssertUnwindSafe(|| call(detector)))
        .map_err(|payload| DetectorFault::Panicked(panic_message(payload.as_ref())))?
}

fn finite(score: f64) -> std::result::Result<f64, DetectorFault> {
    if score.is_finite() {
        Ok(score)
    } else {
        Err(DetectorFault::NonFinite(score))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
