//! Error types for fdfd-adjoint.

use thiserror::Error;

use crate::fields::{Component, Polarization};

#[derive(Debug, Error)]
pub enum FdfdError {
    /// Non-positive dimensions, bad cell size or frequency, or a PML wider than half the grid.
    #[error("invalid grid specification: {0}")]
    InvalidGridSpec(String),

    /// Singular or near-singular matrix, e.g. zero permittivity: failed
    /// factorization, a vanishing pivot, or a solve that does not satisfy its system.
    #[error("ill-conditioned system: {0}")]
    IllConditionedSystem(String),

    /// The nonlinear fixed point did not stabilize within its iteration budget.
    #[error(
        "nonlinear solve did not converge after {iterations} iterations \
         (last relative change {residual:.3e})"
    )]
    ConvergenceFailure { iterations: usize, residual: f64 },

    #[error("unsupported differentiation mode '{0}', expected reverse, forward or numerical")]
    ModeMismatch(String),

    #[error("{component} is not solved for in {polarization:?} polarization")]
    MissingComponent {
        component: Component,
        polarization: Polarization,
    },

    /// A well-formed request the solver does not implement.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("sparse assembly failed: {0}")]
    SparseAssembly(String),

    #[error("shape mismatch: expected {expected} values, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FdfdError>;

/// Fail with [`FdfdError::ShapeMismatch`] unless `found == expected`.
pub(crate) fn check_len(expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(FdfdError::ShapeMismatch { expected, found })
    }
}
