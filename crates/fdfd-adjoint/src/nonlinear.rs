//! Self-consistent solves with intensity-dependent permittivity
//!
//! The permittivity is a pointwise function of the linear permittivity and
//! the local intensity `|Ez|^2`, so the solve becomes the fixed point
//! `A(eps(x)) x = b`. Two iteration schemes reach it:
//!
//! * Born: re-solve the linear system at `eps(x_prev)` until the field stops
//!   changing.
//! * Newton: after one Born step, apply Newton updates with the real-linear
//!   Jacobian `T dx = M dx + diag(Q) conj(dx)`, where
//!   `M = A(eps) + diag(P)`, `P = -omega^2 eps0 f' |x|^2`, `Q = -omega^2 eps0 f' x^2`
//!   and `f' = d eps / d|x|^2`.
//!
//! `T` is not complex-linear, so it is solved through the augmented system
//! `[[M, Q], [conj Q, conj M]] [dx; conj dx] = [r; conj r]`. The same operator
//! linearizes the fixed point for differentiation: gradients and tangents are
//! taken at the converged field through `T`, not through the iteration history.

use std::sync::{Arc, OnceLock};

use faer::complex_native::c64;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adjoint::Differentiable;
use crate::error::{check_len, FdfdError, Result};
use crate::fields::{Fields, Polarization};
use crate::grid::{Grid, Pml};
use crate::maxwell::MaxwellOperator;
use crate::operators::{
    apply, diagonal, from_triplets, triplets, DerivativeOperators, OperatorCache, SparseMatrix,
};
use crate::pml::PmlProfile;
use crate::simulation::validate_omega;
use crate::solver::{Factorization, SolverBackend};

/// Pointwise permittivity as a function of linear permittivity and intensity `|E|^2`.
pub trait PermittivityModel {
    fn permittivity(&self, linear: f64, intensity: f64) -> f64;

    /// d eps / d intensity
    fn intensity_derivative(&self, linear: f64, intensity: f64) -> f64;

    /// d eps / d linear
    fn linear_derivative(&self, linear: f64, intensity: f64) -> f64;
}

/// Kerr medium: `eps = eps_lin + 3 chi3 |E|^2`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kerr {
    pub chi3: f64,
}

impl PermittivityModel for Kerr {
    fn permittivity(&self, linear: f64, intensity: f64) -> f64 {
        linear + 3.0 * self.chi3 * intensity
    }

    fn intensity_derivative(&self, _linear: f64, _intensity: f64) -> f64 {
        3.0 * self.chi3
    }

    fn linear_derivative(&self, _linear: f64, _intensity: f64) -> f64 {
        1.0
    }
}

/// Kerr response proportional to the linear permittivity:
/// `eps = eps_lin (1 + 3 chi3 |E|^2)`, so only material cells respond.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaledKerr {
    pub chi3: f64,
}

impl PermittivityModel for ScaledKerr {
    fn permittivity(&self, linear: f64, intensity: f64) -> f64 {
        linear + 3.0 * linear * self.chi3 * intensity
    }

    fn intensity_derivative(&self, linear: f64, _intensity: f64) -> f64 {
        3.0 * linear * self.chi3
    }

    fn linear_derivative(&self, _linear: f64, intensity: f64) -> f64 {
        1.0 + 3.0 * self.chi3 * intensity
    }
}

impl<M: PermittivityModel + ?Sized> PermittivityModel for Box<M> {
    fn permittivity(&self, linear: f64, intensity: f64) -> f64 {
        (**self).permittivity(linear, intensity)
    }

    fn intensity_derivative(&self, linear: f64, intensity: f64) -> f64 {
        (**self).intensity_derivative(linear, intensity)
    }

    fn linear_derivative(&self, linear: f64, intensity: f64) -> f64 {
        (**self).linear_derivative(linear, intensity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationScheme {
    Born,
    #[default]
    Newton,
}

/// Stopping rule of the fixed-point iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonlinearConfig {
    /// Relative field change (or relative residual) that counts as converged
    pub tolerance: f64,
    /// Linear solves allowed before giving up
    pub max_iterations: usize,
    pub scheme: IterationScheme,
}

impl Default for NonlinearConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 50,
            scheme: IterationScheme::Newton,
        }
    }
}

/// Solver handle for Ez polarization with field-dependent permittivity.
#[derive(Debug)]
pub struct NonlinearSimulation<M> {
    grid: Grid,
    pml: Pml,
    omega: f64,
    backend: SolverBackend,
    config: NonlinearConfig,
    ops: Arc<DerivativeOperators>,
    eps_lin: Vec<f64>,
    model: M,
}

impl<M: PermittivityModel> NonlinearSimulation<M> {
    pub fn new(grid: Grid, pml: Pml, omega: f64, eps_lin: Vec<f64>, model: M) -> Result<Self> {
        validate_omega(omega)?;
        pml.validate(&grid)?;
        let ops = DerivativeOperators::new(&grid, &pml, omega, &PmlProfile::default())?;
        let ops = Arc::new(ops);
        Self::with_operators(grid, pml, omega, eps_lin, model, ops)
    }

    pub fn with_cache(
        grid: Grid,
        pml: Pml,
        omega: f64,
        eps_lin: Vec<f64>,
        model: M,
        profile: &PmlProfile,
        cache: &mut OperatorCache,
    ) -> Result<Self> {
        validate_omega(omega)?;
        pml.validate(&grid)?;
        let ops = cache.get_or_build(&grid, &pml, omega, profile)?;
        Self::with_operators(grid, pml, omega, eps_lin, model, ops)
    }

    fn with_operators(
        grid: Grid,
        pml: Pml,
        omega: f64,
        eps_lin: Vec<f64>,
        model: M,
        ops: Arc<DerivativeOperators>,
    ) -> Result<Self> {
        check_len(grid.len(), eps_lin.len())?;
        Ok(Self {
            grid,
            pml,
            omega,
            backend: SolverBackend::default(),
            config: NonlinearConfig::default(),
            ops,
            eps_lin,
            model,
        })
    }

    pub fn with_backend(mut self, backend: SolverBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_config(mut self, config: NonlinearConfig) -> Self {
        self.config = config;
        self
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn pml(&self) -> Pml {
        self.pml
    }

    pub fn config(&self) -> &NonlinearConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn set_model(&mut self, model: M) {
        self.model = model;
    }

    pub fn permittivity(&self) -> &[f64] {
        &self.eps_lin
    }

    /// Replace the linear permittivity the model is evaluated with.
    pub fn set_permittivity(&mut self, eps_lin: &[f64]) -> Result<()> {
        check_len(self.grid.len(), eps_lin.len())?;
        self.eps_lin.clear();
        self.eps_lin.extend_from_slice(eps_lin);
        Ok(())
    }

    fn operator(&self) -> MaxwellOperator<'_> {
        MaxwellOperator::new(&self.ops, &self.grid, self.omega, Polarization::Ez)
    }

    /// Permittivity at the field `x`
    pub fn effective_permittivity(&self, x: &[Complex64]) -> Vec<f64> {
        self.eps_lin
            .iter()
            .zip(x)
            .map(|(&lin, v)| self.model.permittivity(lin, v.norm_sqr()))
            .collect()
    }

    pub fn solve(&self, source: &[Complex64]) -> Result<Fields> {
        Ok(self.solve_linearized(source)?.fields)
    }

    pub fn solve_linearized(&self, source: &[Complex64]) -> Result<NonlinearSolution> {
        let start = vec![Complex64::new(0.0, 0.0); self.grid.len()];
        self.solve_from(source, &start)
    }

    /// Solve starting the iteration from the field `initial` (e.g. a previous solution).
    pub fn solve_from(
        &self,
        source: &[Complex64],
        initial: &[Complex64],
    ) -> Result<NonlinearSolution> {
        check_len(self.grid.len(), initial.len())?;
        let op = self.operator();
        let b = op.excitation(source)?;
        let b_norm = norm(&b);
        let config = &self.config;

        let mut x = initial.to_vec();
        let mut change = f64::INFINITY;
        for iteration in 1..=config.max_iterations {
            let eps = self.effective_permittivity(&x);
            let a = op.assemble(&eps)?;

            if config.scheme == IterationScheme::Newton && iteration > 1 {
                let r: Vec<Complex64> = apply(&a, &x)
                    .iter()
                    .zip(&b)
                    .map(|(ax, b)| ax - b)
                    .collect();
                let residual = if b_norm > 0.0 { norm(&r) / b_norm } else { norm(&r) };
                debug!(iteration, residual, "newton residual");
                if residual < config.tolerance {
                    return self.converged(x, iteration - 1, residual);
                }
                let linearization = self.linearize(&a, &x)?;
                let minus_r: Vec<Complex64> = r.iter().map(|v| -v).collect();
                let dx = linearization.solve(&minus_r, self.backend)?;
                for (xi, di) in x.iter_mut().zip(&dx) {
                    *xi += di;
                }
                change = relative(norm(&dx), norm(&x));
            } else {
                let x_new = Factorization::new(&a, self.backend)?.solve(&b)?;
                let diff: Vec<Complex64> = x_new.iter().zip(&x).map(|(n, o)| n - o).collect();
                change = relative(norm(&diff), norm(&x_new));
                x = x_new;
            }

            debug!(iteration, change, scheme = ?config.scheme, "nonlinear iteration");
            if change < config.tolerance {
                return self.converged(x, iteration, change);
            }
        }

        warn!(
            iterations = config.max_iterations,
            residual = change,
            "nonlinear solve exhausted its iteration budget"
        );
        Err(FdfdError::ConvergenceFailure {
            iterations: config.max_iterations,
            residual: change,
        })
    }

    fn converged(
        &self,
        x: Vec<Complex64>,
        iterations: usize,
        residual: f64,
    ) -> Result<NonlinearSolution> {
        info!(iterations, residual, "nonlinear solve converged");
        let eps = self.effective_permittivity(&x);
        let fields = self.operator().fields(&eps, &x)?;
        let linear_derivative = self
            .eps_lin
            .iter()
            .zip(&x)
            .map(|(&lin, v)| self.model.linear_derivative(lin, v.norm_sqr()))
            .collect();
        let a = self.operator().assemble(&eps)?;
        let linearization = self.linearize(&a, &x)?;
        Ok(NonlinearSolution {
            grid: self.grid,
            omega: self.omega,
            backend: self.backend,
            ops: Arc::clone(&self.ops),
            eps,
            linear_derivative,
            x,
            fields,
            iterations,
            residual,
            linearization,
            augmented: OnceLock::new(),
        })
    }

    /// Jacobian of `x -> A(eps(x)) x` at `x`
    fn linearize(&self, a: &SparseMatrix, x: &[Complex64]) -> Result<Linearization> {
        let k0 = self.operator().permittivity_coupling();
        let mut p = Vec::with_capacity(x.len());
        let mut q = Vec::with_capacity(x.len());
        for (&lin, &v) in self.eps_lin.iter().zip(x) {
            let slope = -k0 * self.model.intensity_derivative(lin, v.norm_sqr());
            p.push(Complex64::new(slope * v.norm_sqr(), 0.0));
            q.push(v * v * slope);
        }
        Ok(Linearization {
            m: a + &diagonal(&p)?,
            q,
        })
    }
}

/// `T dx = M dx + diag(Q) conj(dx)`
#[derive(Debug, Clone)]
struct Linearization {
    m: SparseMatrix,
    q: Vec<Complex64>,
}

impl Linearization {
    /// `[[M, Q], [conj Q, conj M]]`
    fn augmented(&self) -> Result<SparseMatrix> {
        let n = self.m.nrows();
        let entries: Vec<_> = triplets(&self.m)
            .flat_map(|(i, j, v)| [(i, j, v), (n + i, n + j, v.conj())])
            .chain(
                self.q
                    .iter()
                    .enumerate()
                    .flat_map(|(k, &q)| [(k, n + k, q), (n + k, k, q.conj())]),
            )
            .map(|(i, j, v)| (i, j, c64::from(v)))
            .collect();
        from_triplets(2 * n, 2 * n, &entries)
    }

    /// Solve `T y = rhs` with a fresh factorization.
    fn solve(&self, rhs: &[Complex64], backend: SolverBackend) -> Result<Vec<Complex64>> {
        let lu = Factorization::new(&self.augmented()?, backend)?;
        solve_augmented(&lu, rhs, false)
    }
}

fn stack(rhs: &[Complex64]) -> Vec<Complex64> {
    rhs.iter().copied().chain(rhs.iter().map(|v| v.conj())).collect()
}

/// Solve `T y = rhs` (or `T^† y = rhs`) given the factored augmented matrix.
fn solve_augmented(
    lu: &Factorization,
    rhs: &[Complex64],
    adjoint: bool,
) -> Result<Vec<Complex64>> {
    let n = rhs.len();
    let stacked = stack(rhs);
    let mut y = if adjoint {
        lu.solve_adjoint(&stacked)?
    } else {
        lu.solve(&stacked)?
    };
    y.truncate(n);
    Ok(y)
}

fn norm(v: &[Complex64]) -> f64 {
    v.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

fn relative(delta: f64, scale: f64) -> f64 {
    if scale > 0.0 {
        delta / scale
    } else {
        delta
    }
}

/// Converged operating point of a nonlinear solve.
#[derive(Debug)]
pub struct NonlinearSolution {
    grid: Grid,
    omega: f64,
    backend: SolverBackend,
    ops: Arc<DerivativeOperators>,
    eps: Vec<f64>,
    linear_derivative: Vec<f64>,
    x: Vec<Complex64>,
    fields: Fields,
    iterations: usize,
    residual: f64,
    linearization: Linearization,
    augmented: OnceLock<Factorization>,
}

impl NonlinearSolution {
    /// Linear solves (Born steps plus Newton updates) taken to converge
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Final relative change or residual
    pub fn residual(&self) -> f64 {
        self.residual
    }

    /// Effective permittivity at the converged field
    pub fn permittivity(&self) -> &[f64] {
        &self.eps
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    fn operator(&self) -> MaxwellOperator<'_> {
        MaxwellOperator::new(&self.ops, &self.grid, self.omega, Polarization::Ez)
    }

    fn factored(&self) -> Result<&Factorization> {
        if let Some(lu) = self.augmented.get() {
            return Ok(lu);
        }
        let lu = Factorization::new(&self.linearization.augmented()?, self.backend)?;
        Ok(self.augmented.get_or_init(|| lu))
    }
}

impl Differentiable for NonlinearSolution {
    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn vector_jacobian_product(&self, seed: &Fields) -> Result<Vec<f64>> {
        let op = self.operator();
        let (cotangent, explicit) = op.pullback(&self.eps, &self.x, seed)?;
        let lambda = solve_augmented(self.factored()?, &cotangent, true)?;
        let grad = op.matrix_gradient(&self.eps, &self.x, &lambda)?;
        Ok(grad
            .iter()
            .zip(&self.linear_derivative)
            .zip(&explicit)
            .map(|((g, d), e)| (g + e) * d)
            .collect())
    }

    fn jacobian_vector_product(&self, direction: &[f64]) -> Result<Fields> {
        check_len(self.grid.len(), direction.len())?;
        let op = self.operator();
        let delta: Vec<f64> = direction
            .iter()
            .zip(&self.linear_derivative)
            .map(|(d, s)| d * s)
            .collect();
        let rhs: Vec<Complex64> = op
            .matrix_tangent(&self.eps, &self.x, &delta)?
            .into_iter()
            .map(|v| -v)
            .collect();
        let x_dot = solve_augmented(self.factored()?, &rhs, false)?;
        op.fields_tangent(&self.eps, &self.x, &x_dot, &delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{point_source, Simulation};

    const OMEGA: f64 = 2.0 * std::f64::consts::PI * 200e12;

    fn setup() -> (Grid, Pml, Vec<f64>, Vec<Complex64>) {
        let grid = Grid::new(14, 14, 5e-8).unwrap();
        let eps: Vec<f64> = (0..grid.len()).map(|k| 1.0 + ((k * 13 % 7) as f64) / 7.0).collect();
        let source = point_source(&grid, 7, 7, Complex64::new(1e3, 0.0)).unwrap();
        (grid, Pml::new(3, 3), eps, source)
    }

    #[test]
    fn test_models() {
        let kerr = Kerr { chi3: 2.0 };
        assert_eq!(kerr.permittivity(1.5, 0.5), 4.5);
        assert_eq!(kerr.intensity_derivative(1.5, 0.5), 6.0);
        let scaled = ScaledKerr { chi3: 2.0 };
        assert_eq!(scaled.permittivity(2.0, 0.5), 8.0);
        assert_eq!(scaled.linear_derivative(2.0, 0.5), 4.0);
        assert_eq!(scaled.intensity_derivative(2.0, 0.5), 12.0);
    }

    #[test]
    fn test_zero_chi3_matches_linear_solve() {
        let (grid, pml, eps, source) = setup();
        let mut linear = Simulation::new(grid, pml, OMEGA, Polarization::Ez, eps.clone()).unwrap();
        let expected = linear.solve(&source).unwrap();
        for scheme in [IterationScheme::Born, IterationScheme::Newton] {
            let config = NonlinearConfig {
                scheme,
                ..NonlinearConfig::default()
            };
            let nl = NonlinearSimulation::new(grid, pml, OMEGA, eps.clone(), Kerr { chi3: 0.0 })
                .unwrap()
                .with_config(config);
            assert_eq!(nl.solve(&source).unwrap(), expected, "{:?}", scheme);
        }
    }

    #[test]
    fn test_schemes_agree() {
        let (grid, pml, eps, source) = setup();
        let solve = |scheme| {
            let config = NonlinearConfig {
                scheme,
                tolerance: 1e-12,
                ..NonlinearConfig::default()
            };
            NonlinearSimulation::new(grid, pml, OMEGA, eps.clone(), ScaledKerr { chi3: 2000.0 })
                .unwrap()
                .with_config(config)
                .solve_linearized(&source)
                .unwrap()
        };
        let born = solve(IterationScheme::Born);
        let newton = solve(IterationScheme::Newton);
        assert!(born.iterations() <= 50 && newton.iterations() <= 50);
        let scale = born.x.iter().map(|v| v.norm()).fold(0.0, f64::max);
        for (a, b) in born.x.iter().zip(&newton.x) {
            assert!((a - b).norm() < 1e-9 * scale);
        }
    }

    #[test]
    fn test_converged_field_is_self_consistent() {
        let (grid, pml, eps, source) = setup();
        let nl = NonlinearSimulation::new(grid, pml, OMEGA, eps, Kerr { chi3: 2000.0 }).unwrap();
        let sol = nl.solve_linearized(&source).unwrap();
        let a = nl.operator().assemble(sol.permittivity()).unwrap();
        let b = nl.operator().excitation(&source).unwrap();
        let r: Vec<Complex64> = apply(&a, &sol.x)
            .iter()
            .zip(&b)
            .map(|(l, r)| l - r)
            .collect();
        assert!(norm(&r) < 1e-8 * norm(&b));
    }

    #[test]
    fn test_budget_exhaustion_is_reported() {
        let (grid, pml, eps, source) = setup();
        let config = NonlinearConfig {
            max_iterations: 1,
            ..NonlinearConfig::default()
        };
        let nl = NonlinearSimulation::new(grid, pml, OMEGA, eps, Kerr { chi3: 2000.0 })
            .unwrap()
            .with_config(config);
        match nl.solve(&source) {
            Err(FdfdError::ConvergenceFailure { iterations, residual }) => {
                assert_eq!(iterations, 1);
                assert!(residual > 0.0);
            }
            other => panic!("expected ConvergenceFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_warm_start_from_solution() {
        let (grid, pml, eps, source) = setup();
        let nl = NonlinearSimulation::new(grid, pml, OMEGA, eps, Kerr { chi3: 2000.0 })
            .unwrap()
            .with_config(NonlinearConfig {
                scheme: IterationScheme::Born,
                ..NonlinearConfig::default()
            });
        let cold = nl.solve_linearized(&source).unwrap();
        let warm = nl.solve_from(&source, &cold.x).unwrap();
        assert!(warm.iterations() < cold.iterations());
    }

    #[test]
    fn test_linearization_matches_residual_difference() {
        // R(x + t d) - R(x) ~ t T d
        let (grid, pml, eps, source) = setup();
        let model = ScaledKerr { chi3: 2000.0 };
        let nl = NonlinearSimulation::new(grid, pml, OMEGA, eps, model).unwrap();
        let x = nl.solve(&source).unwrap().primary().to_vec();
        let residual = |x: &[Complex64]| {
            let a = nl.operator().assemble(&nl.effective_permittivity(x)).unwrap();
            apply(&a, x)
        };
        let d: Vec<Complex64> = x.iter().map(|v| v * Complex64::new(0.3, 0.8)).collect();
        let t = 1e-6;
        let shifted: Vec<Complex64> = x.iter().zip(&d).map(|(a, b)| a + b * t).collect();
        let (r0, r1) = (residual(&x), residual(&shifted));

        let a = nl.operator().assemble(&nl.effective_permittivity(&x)).unwrap();
        let lin = nl.linearize(&a, &x).unwrap();
        let md = apply(&lin.m, &d);
        let scale = norm(&md);
        for k in 0..x.len() {
            let exact = md[k] + lin.q[k] * d[k].conj();
            let fd = (r1[k] - r0[k]) / t;
            assert!((fd - exact).norm() < 1e-5 * scale);
        }
    }
}
