//! fdfd-adjoint: 2-D finite-difference frequency-domain Maxwell solver with adjoint gradients
//!
//! This crate provides:
//! - PML-stretched derivative operators and system assembly for Ez and Hz polarizations
//! - Direct sparse solves that reuse one factorization for forward and adjoint systems
//! - Self-consistent solves for Kerr media, differentiated at the fixed point
//! - Reverse, forward and numerical Jacobians of field objectives
//!
//! All quantities are SI. Grid arrays are flat, row-major over `(nx, ny)`.

pub mod adjoint;
pub mod config;
pub mod constants;
pub mod error;
pub mod fields;
pub mod grid;
pub mod jacobian;
pub mod maxwell;
pub mod nonlinear;
pub mod objective;
pub mod operators;
pub mod pml;
pub mod simulation;
pub mod solver;

pub use adjoint::{Differentiable, LinearSolution};
pub use config::{KerrSpec, ObjectiveSpec, ProblemSpec, SolverConfig};
pub use error::{FdfdError, Result};
pub use fields::{Component, Fields, Polarization};
pub use grid::{Grid, Pml};
pub use jacobian::{jacobian, Design, DesignSolver, DiffMode, DifferenceScheme, FiniteDifference};
pub use nonlinear::{
    IterationScheme, Kerr, NonlinearConfig, NonlinearSimulation, NonlinearSolution,
    PermittivityModel, ScaledKerr,
};
pub use objective::{IntensitySum, ModeOverlap, Objective, ProbeIntensities};
pub use operators::{DerivativeOperators, OperatorCache, SparseMatrix};
pub use pml::PmlProfile;
pub use simulation::{create_solver, point_source, Simulation};
pub use solver::SolverBackend;
