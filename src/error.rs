//! Error types for rssi-positioning

use thiserror::Error;

/// Errors returned by the positioning components.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A required argument is missing, empty or out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A supplied covariance matrix is not symmetric positive-definite.
    #[error("covariance matrix is not symmetric positive-definite")]
    InvalidCovariance,

    /// `estimate()` was called before all required data was provided.
    #[error("estimator is not ready")]
    NotReady,

    /// A mutator or `estimate()` was called while an estimation is in progress.
    #[error("estimator is locked")]
    Locked,

    /// No located fingerprint shares a radio source with the query fingerprint.
    #[error("no nearest fingerprint could be resolved")]
    NearestFingerprintNotFound,

    /// The working set yields fewer residuals than unknowns.
    #[error("not enough readings: {rows} residuals for {unknowns} unknowns")]
    NotEnoughReadings { rows: usize, unknowns: usize },

    /// The normal equations cannot be inverted at the solution.
    #[error("normal equations are singular")]
    SingularNormalEquations,

    /// The weighted cost is NaN or infinite, so no descent direction can be judged.
    #[error("least-squares cost is not finite")]
    NonFiniteCost,

    /// Propagated covariance is not positive-definite.
    #[error("estimated covariance is not positive-definite")]
    NonPositiveDefiniteCovariance,

    /// The solver reached its iteration cap and non-convergence is configured as a failure.
    #[error("solver did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
