use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Why a single detector call did not produce a usable score.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorFault {
    #[error("detector returned an error: {0}")]
    Raised(String),

    #[error("detector panicked: {0}")]
    Panicked(String),

    #[error("detector returned a non-finite score ({0})")]
    NonFinite(f64),

    #[error("detector call exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("detector returned {actual} scores for a batch of {expected}")]
    BatchSize { expected: usize, actual: usize },
}

/// Position in a search at which a detector failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailureContext {
    /// Search iteration (0 = evaluation of the original series).
    pub iteration: usize,
    /// Generation index of the candidate being scored.
    pub generation: u64,
}

#[derive(Error, Debug)]
pub enum TscfError {
    /// Malformed series, non-finite threshold or out-of-range configuration.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A series does not share the original's channels or time index.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Detector failure{}: {fault}", describe_context(.context))]
    DetectorFailure {
        fault: DetectorFault,
        context: Option<FailureContext>,
    },

    /// A generated candidate broke an engine invariant. Always fatal.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_context(context: &Option<FailureContext>) -> String {
    match context {
        Some(c) => format!(" at iteration {} (candidate #{})", c.iteration, c.generation),
        None => String::new(),
    }
}

impl TscfError {
    /// Wrap a detector fault that has no search context yet.
    pub fn detector(fault: DetectorFault) -> Self {
        TscfError::DetectorFailure {
            fault,
            context: None,
        }
    }

    /// Attach search context to a detector failure. Other variants pass through.
    pub fn with_context(self, ctx: FailureContext) -> Self {
        match self {
            TscfError::DetectorFailure { fault, .. } => TscfError::DetectorFailure {
                fault,
                context: Some(ctx),
            },
            other => other,
        }
    }

    /// The search context of a detector failure, if any.
    pub fn failure_context(&self) -> Option<FailureContext> {
        match self {
            TscfError::DetectorFailure { context, .. } => *context,
            _ => None,
        }
    }

    /// The underlying fault of a detector failure, if any.
    pub fn detector_fault(&self) -> Option<&DetectorFault> {
        match self {
            TscfError::DetectorFailure { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TscfError>;
