//! Error types shared across the crate.

use thiserror::Error;

/// Errors surfaced by the phasing engine. There is no local recovery:
/// every failure propagates to the caller.
#[derive(Error, Debug, PartialEq)]
pub enum PhaseError {
    /// The tiling depth of the input reads exceeds the configured maximum.
    #[error("coverage depth {depth} exceeds the configured maximum of {max}")]
    CoverageExceeded { depth: usize, max: usize },
    /// Two HMMs cannot be fused, aligned or cross-producted together.
    #[error("incompatible hmms: {reason}")]
    HmmMismatch { reason: String },
    /// Traceback could not find a compatible merge cell. Usually a sign
    /// that pruning was too aggressive.
    #[error("traceback failed: a merge cell is missing from the hmm, is the pruning too aggressive?")]
    TracebackInfeasible,
    /// A public call was handed a zero-length reference interval.
    #[error("zero length reference interval")]
    InvalidCoordinates,
}

impl PhaseError {
    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        PhaseError::HmmMismatch {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PhaseError>;
