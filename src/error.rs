/// Crate-wide error type.
///
/// Only structurally invalid input is an error. Optimizer non-convergence is
/// *not*: a fit that exhausts its iteration budget still returns its best
/// point, and callers judge quality from the chi-square and iteration count.
#[derive(Clone, PartialEq, Eq)]
pub enum FitError {
    /// Bad fit window, non-positive variance, zero free parameters,
    /// non-positive degrees of freedom, out-of-range binning/fit bounds.
    InvalidConfiguration(String),
    /// A dependent computation was requested before its prerequisite ran
    /// (e.g. the diffusion-law line fit before any sweep).
    StateError(String),
    /// Malformed batched-call inputs. The whole batch is rejected before any
    /// fit slot is processed; there are no partial results.
    BatchSubmission(String),
}

impl FitError {
    pub fn config(message: impl Into<String>) -> Self {
        FitError::InvalidConfiguration(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        FitError::StateError(message.into())
    }

    pub fn batch(message: impl Into<String>) -> Self {
        FitError::BatchSubmission(message.into())
    }
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            FitError::StateError(msg) => write!(f, "state error: {msg}"),
            FitError::BatchSubmission(msg) => write!(f, "batch submission rejected: {msg}"),
        }
    }
}

impl std::fmt::Debug for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for FitError {}
