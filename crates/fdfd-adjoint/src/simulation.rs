//! Linear FDFD simulation handle
//!
//! A [`Simulation`] owns the grid, PML, frequency, polarization, the shared
//! derivative operators and the current permittivity. The factored system
//! matrix is cached for the current permittivity and dropped whenever
//! [`Simulation::set_permittivity`] assigns a different array; grid, PML and
//! frequency are fixed for the lifetime of the handle.

use std::sync::Arc;

use nalgebra::DMatrix;
use num_complex::Complex64;
use tracing::debug;

use crate::adjoint::LinearSolution;
use crate::error::{check_len, FdfdError, Result};
use crate::fields::{Fields, Polarization};
use crate::grid::{Grid, Pml};
use crate::maxwell::MaxwellOperator;
use crate::operators::{DerivativeOperators, OperatorCache};
use crate::pml::PmlProfile;
use crate::solver::{Factorization, SolverBackend};

/// Solver handle for one grid, PML and frequency.
#[derive(Debug)]
pub struct Simulation {
    grid: Grid,
    pml: Pml,
    omega: f64,
    polarization: Polarization,
    backend: SolverBackend,
    ops: Arc<DerivativeOperators>,
    eps: Vec<f64>,
    factored: Option<Arc<Factorization>>,
}

/// Build a linear solver handle from an `(nx, ny)` relative permittivity array.
pub fn create_solver(
    omega: f64,
    dl: f64,
    eps_r: &DMatrix<f64>,
    pml: impl Into<Pml>,
    polarization: Polarization,
) -> Result<Simulation> {
    let grid = Grid::new(eps_r.nrows(), eps_r.ncols(), dl)?;
    let eps = grid.flatten(eps_r)?;
    Simulation::new(grid, pml.into(), omega, polarization, eps)
}

/// Reject frequencies the PML and system matrices cannot be built for.
pub(crate) fn validate_omega(omega: f64) -> Result<()> {
    if omega.is_finite() && omega > 0.0 {
        Ok(())
    } else {
        Err(FdfdError::InvalidGridSpec(format!(
            "angular frequency must be positive, got {omega}"
        )))
    }
}

/// Source array with a single nonzero cell.
pub fn point_source(
    grid: &Grid,
    ix: usize,
    iy: usize,
    amplitude: Complex64,
) -> Result<Vec<Complex64>> {
    if ix >= grid.nx || iy >= grid.ny {
        return Err(FdfdError::InvalidGridSpec(format!(
            "source at ({ix}, {iy}) lies outside the {}x{} grid",
            grid.nx, grid.ny
        )));
    }
    let mut source = vec![Complex64::new(0.0, 0.0); grid.len()];
    source[grid.index(ix, iy)] = amplitude;
    Ok(source)
}

impl Simulation {
    pub fn new(
        grid: Grid,
        pml: Pml,
        omega: f64,
        polarization: Polarization,
        eps: Vec<f64>,
    ) -> Result<Self> {
        validate_omega(omega)?;
        pml.validate(&grid)?;
        let ops = DerivativeOperators::new(&grid, &pml, omega, &PmlProfile::default())?;
        let ops = Arc::new(ops);
        Self::with_operators(grid, pml, omega, polarization, eps, ops)
    }

    /// Like [`Simulation::new`], reusing derivative operators from `cache`.
    pub fn with_cache(
        grid: Grid,
        pml: Pml,
        omega: f64,
        polarization: Polarization,
        eps: Vec<f64>,
        profile: &PmlProfile,
        cache: &mut OperatorCache,
    ) -> Result<Self> {
        validate_omega(omega)?;
        pml.validate(&grid)?;
        let ops = cache.get_or_build(&grid, &pml, omega, profile)?;
        Self::with_operators(grid, pml, omega, polarization, eps, ops)
    }

    fn with_operators(
        grid: Grid,
        pml: Pml,
        omega: f64,
        polarization: Polarization,
        eps: Vec<f64>,
        ops: Arc<DerivativeOperators>,
    ) -> Result<Self> {
        check_len(grid.len(), eps.len())?;
        Ok(Self {
            grid,
            pml,
            omega,
            polarization,
            backend: SolverBackend::default(),
            ops,
            eps,
            factored: None,
        })
    }

    pub fn with_backend(mut self, backend: SolverBackend) -> Self {
        if backend != self.backend {
            self.factored = None;
        }
        self.backend = backend;
        self
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn pml(&self) -> Pml {
        self.pml
    }

    pub fn omega(&self) -> f64 {
        self.omega
    }

    pub fn polarization(&self) -> Polarization {
        self.polarization
    }

    pub fn backend(&self) -> SolverBackend {
        self.backend
    }

    pub fn operators(&self) -> &Arc<DerivativeOperators> {
        &self.ops
    }

    pub fn permittivity(&self) -> &[f64] {
        &self.eps
    }

    /// Assembler bound to this handle's operators
    pub fn operator(&self) -> MaxwellOperator<'_> {
        MaxwellOperator::new(&self.ops, &self.grid, self.omega, self.polarization)
    }

    /// Replace the permittivity. The cached factorization survives only if
    /// `eps` is identical to the current array.
    pub fn set_permittivity(&mut self, eps: &[f64]) -> Result<()> {
        check_len(self.grid.len(), eps.len())?;
        if self.eps.as_slice() != eps {
            if self.factored.take().is_some() {
                debug!("permittivity changed, dropping cached factorization");
            }
            self.eps.clear();
            self.eps.extend_from_slice(eps);
        }
        Ok(())
    }

    /// Whether a factorization of the current system is held
    pub fn is_factored(&self) -> bool {
        self.factored.is_some()
    }

    fn factorization(&mut self) -> Result<Arc<Factorization>> {
        if let Some(lu) = &self.factored {
            debug!("reusing cached factorization");
            return Ok(Arc::clone(lu));
        }
        let matrix = self.operator().assemble(&self.eps)?;
        let lu = Arc::new(Factorization::new(&matrix, self.backend)?);
        self.factored = Some(Arc::clone(&lu));
        Ok(lu)
    }

    /// Solve for all field components driven by `source`.
    pub fn solve(&mut self, source: &[Complex64]) -> Result<Fields> {
        Ok(self.solve_linearized(source)?.into_fields())
    }

    /// Solve and keep everything needed to differentiate the result.
    pub fn solve_linearized(&mut self, source: &[Complex64]) -> Result<LinearSolution> {
        let b = self.operator().excitation(source)?;
        let lu = self.factorization()?;
        let x = lu.solve(&b)?;
        let fields = self.operator().fields(&self.eps, &x)?;
        Ok(LinearSolution::new(
            self.grid,
            self.omega,
            self.polarization,
            Arc::clone(&self.ops),
            self.eps.clone(),
            x,
            lu,
            fields,
        ))
    }
}
