//! Error taxonomy of the reconstruction engine.
//!
//! Transient conditions (failed rational reconstruction, failed guess test,
//! unusable shift) are recovered internally and never surface here.

use thiserror::Error;

use crate::dense_solver::SolverError;

#[derive(Debug, Error)]
pub enum FireFlyError {
    /// Malformed user input, reported before any compute.
    #[error("FireFly error: {0}")]
    Input(String),

    /// An unrecoverable algorithmic condition, e.g. a singular linear system
    /// or an exhausted re-anchoring budget.
    #[error("FireFly error: {0}")]
    Algorithm(String),

    /// File system failure while persisting or loading state.
    #[error("FireFly error: {0}")]
    Io(#[from] std::io::Error),

    /// Inconsistent saved state detected during resume.
    #[error("FireFly error: resume failed: {0}")]
    Resume(String),
}

impl From<SolverError> for FireFlyError {
    fn from(e: SolverError) -> Self {
        FireFlyError::Algorithm(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FireFlyError>;
