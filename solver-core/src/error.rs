//! Structured error kinds, per §7. Degeneracy and divergence are recovered
//! locally and never surface as an `Err` from [`crate::optimize_project`];
//! only configuration errors and cancellation propagate to the caller.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no fully-locked point exists to anchor the scene")]
    NoLockedPoints,
    #[error("no scale constraint (target length or locked-point pair) exists to fix scene scale")]
    NoScaleConstraint,
    #[error("project has no viewpoints to solve against")]
    NoViewpoints,
    #[error("project has no features to solve for")]
    NoFeatures,
}

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("solve cancelled by yield_to_ui callback")]
    Cancelled,
}
