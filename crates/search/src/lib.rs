//! Counterfactual explanations for black-box time-series anomaly detectors.
//!
//! Given a series the detector flags (score at or above a threshold), search
//! for a nearby series it does not flag, changing as few and as small values
//! as possible. The search treats the detector as an opaque scoring function.

pub mod baseline;
pub mod engine;
pub mod explainer;
pub mod explanation;
pub mod generator;
pub mod metric;
pub mod oracle;

pub use baseline::{Baseline, BaselineConfig, ChannelBaseline};
pub use engine::{
    CancelHandle, CounterfactualResult, SearchEngine, SearchOutcome, SearchPhase, SearchState,
    SearchStats, TerminationReason,
};
pub use explainer::Explainer;
pub use explanation::{Explanation, ExplanationBuilder, ExplanationStatus};
pub use generator::{Candidate, CandidateGenerator, Edit, EditKind, ProposalContext};
pub use metric::{contiguous_runs, touched_mask, CostBreakdown, DistanceMetric};
pub use oracle::{
    batch_detector_fn, detector_fn, try_detector_fn, BatchFnDetector, Detector, FnDetector,
    TryFnDetector, ValidityOracle,
};
pub use tscf_core::{
    DetectorFault, DistanceWeights, FailureContext, MagnitudeNorm, Result, SearchConfig, Series,
    TscfError,
};
