//! Jacobians of objectives with respect to the permittivity grid
//!
//! A [`Design`] ties a solver, a fixed source and an objective into the map
//! `eps -> objective(solve(eps))`. Its Jacobian has one row per objective
//! output and one column per cell and can be computed three ways:
//!
//! - reverse: one forward solve plus one adjoint solve per output
//! - forward: one forward solve plus one tangent solve per cell
//! - numerical: two (central) or one (forward) extra solves per cell; only
//!   for validating the other two

use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adjoint::{Differentiable, LinearSolution};
use crate::error::{check_len, FdfdError, Result};
use crate::grid::Grid;
use crate::nonlinear::{NonlinearSimulation, NonlinearSolution, PermittivityModel};
use crate::objective::Objective;
use crate::simulation::Simulation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceScheme {
    #[default]
    Central,
    Forward,
}

/// Finite-difference settings for [`DiffMode::Numerical`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiniteDifference {
    /// Permittivity perturbation per cell
    pub step: f64,
    pub scheme: DifferenceScheme,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self {
            step: 1e-4,
            scheme: DifferenceScheme::Central,
        }
    }
}

/// How a Jacobian is computed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiffMode {
    Reverse,
    Forward,
    Numerical(FiniteDifference),
}

impl fmt::Display for DiffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffMode::Reverse => f.write_str("reverse"),
            DiffMode::Forward => f.write_str("forward"),
            DiffMode::Numerical(_) => f.write_str("numerical"),
        }
    }
}

impl FromStr for DiffMode {
    type Err = FdfdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "reverse" => Ok(DiffMode::Reverse),
            "forward" => Ok(DiffMode::Forward),
            "numerical" => Ok(DiffMode::Numerical(FiniteDifference::default())),
            _ => Err(FdfdError::ModeMismatch(s.to_string())),
        }
    }
}

/// A solver that can be re-run at an arbitrary permittivity.
pub trait DesignSolver {
    type Solution: Differentiable;

    fn grid(&self) -> &Grid;

    fn solve_design(&mut self, eps: &[f64], source: &[Complex64]) -> Result<Self::Solution>;
}

impl DesignSolver for Simulation {
    type Solution = LinearSolution;

    fn grid(&self) -> &Grid {
        Simulation::grid(self)
    }

    fn solve_design(&mut self, eps: &[f64], source: &[Complex64]) -> Result<LinearSolution> {
        self.set_permittivity(eps)?;
        self.solve_linearized(source)
    }
}

impl<M: PermittivityModel> DesignSolver for NonlinearSimulation<M> {
    type Solution = NonlinearSolution;

    fn grid(&self) -> &Grid {
        NonlinearSimulation::grid(self)
    }

    fn solve_design(&mut self, eps: &[f64], source: &[Complex64]) -> Result<NonlinearSolution> {
        self.set_permittivity(eps)?;
        self.solve_linearized(source)
    }
}

/// `eps -> objective(solve(eps, source))`
#[derive(Debug)]
pub struct Design<S, O> {
    solver: S,
    source: Vec<Complex64>,
    objective: O,
}

impl<S: DesignSolver, O: Objective> Design<S, O> {
    pub fn new(solver: S, source: Vec<Complex64>, objective: O) -> Result<Self> {
        check_len(solver.grid().len(), source.len())?;
        Ok(Self {
            solver,
            source,
            objective,
        })
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut S {
        &mut self.solver
    }

    pub fn objective(&self) -> &O {
        &self.objective
    }

    pub fn into_solver(self) -> S {
        self.solver
    }

    /// All objective outputs at `eps`
    pub fn evaluate(&mut self, eps: &[f64]) -> Result<Vec<f64>> {
        let solution = self.solver.solve_design(eps, &self.source)?;
        self.objective.evaluate(solution.fields())
    }

    /// Scalar objective value at `eps`
    pub fn value(&mut self, eps: &[f64]) -> Result<f64> {
        self.require_scalar()?;
        Ok(self.evaluate(eps)?[0])
    }

    /// Gradient of a scalar objective
    pub fn gradient(&mut self, eps: &[f64], mode: DiffMode) -> Result<Vec<f64>> {
        self.require_scalar()?;
        Ok(self.jacobian(eps, mode)?.row(0).iter().copied().collect())
    }

    /// Objective value and its reverse-mode gradient from a single forward solve.
    pub fn value_and_gradient(&mut self, eps: &[f64]) -> Result<(f64, Vec<f64>)> {
        self.require_scalar()?;
        let solution = self.solver.solve_design(eps, &self.source)?;
        let value = self.objective.evaluate(solution.fields())?[0];
        let seed = self.objective.cotangent(solution.fields(), 0)?;
        Ok((value, solution.vector_jacobian_product(&seed)?))
    }

    /// `(outputs, cells)` Jacobian at `eps`.
    pub fn jacobian(&mut self, eps: &[f64], mode: DiffMode) -> Result<DMatrix<f64>> {
        let cells = self.solver.grid().len();
        check_len(cells, eps.len())?;
        let outputs = self.objective.num_outputs();
        debug!(%mode, outputs, cells, "computing jacobian");

        match mode {
            DiffMode::Reverse => {
                let solution = self.solver.solve_design(eps, &self.source)?;
                let mut jac = DMatrix::zeros(outputs, cells);
                for i in 0..outputs {
                    let seed = self.objective.cotangent(solution.fields(), i)?;
                    let row = solution.vector_jacobian_product(&seed)?;
                    for (j, g) in row.into_iter().enumerate() {
                        jac[(i, j)] = g;
                    }
                }
                Ok(jac)
            }
            DiffMode::Forward => {
                let solution = self.solver.solve_design(eps, &self.source)?;
                let seeds = (0..outputs)
                    .map(|i| self.objective.cotangent(solution.fields(), i))
                    .collect::<Result<Vec<_>>>()?;
                let mut jac = DMatrix::zeros(outputs, cells);
                let mut direction = vec![0.0; cells];
                for j in 0..cells {
                    direction[j] = 1.0;
                    let tangent = solution.jacobian_vector_product(&direction)?;
                    direction[j] = 0.0;
                    for (i, seed) in seeds.iter().enumerate() {
                        jac[(i, j)] = seed.real_inner(&tangent);
                    }
                }
                Ok(jac)
            }
            DiffMode::Numerical(fd) => self.numerical_jacobian(eps, fd),
        }
    }

    fn numerical_jacobian(&mut self, eps: &[f64], fd: FiniteDifference) -> Result<DMatrix<f64>> {
        let cells = eps.len();
        let outputs = self.objective.num_outputs();
        let base = match fd.scheme {
            DifferenceScheme::Forward => Some(self.evaluate(eps)?),
            DifferenceScheme::Central => None,
        };

        let mut jac = DMatrix::zeros(outputs, cells);
        let mut shifted = eps.to_vec();
        for j in 0..cells {
            shifted[j] = eps[j] + fd.step;
            let plus = self.evaluate(&shifted)?;
            let column: Vec<f64> = match &base {
                Some(base) => plus.iter().zip(base).map(|(p, b)| (p - b) / fd.step).collect(),
                None => {
                    shifted[j] = eps[j] - fd.step;
                    let minus = self.evaluate(&shifted)?;
                    plus.iter().zip(&minus).map(|(p, m)| (p - m) / (2.0 * fd.step)).collect()
                }
            };
            shifted[j] = eps[j];
            for (i, d) in column.into_iter().enumerate() {
                jac[(i, j)] = d;
            }
        }
        Ok(jac)
    }

    fn require_scalar(&self) -> Result<()> {
        check_len(1, self.objective.num_outputs())
    }
}

/// Jacobian function of `design` in the given mode, for an external optimizer.
pub fn jacobian<S, O>(
    design: &mut Design<S, O>,
    mode: DiffMode,
) -> impl FnMut(&[f64]) -> Result<DMatrix<f64>> + '_
where
    S: DesignSolver,
    O: Objective,
{
    move |eps: &[f64]| design.jacobian(eps, mode)
}

/// Relative error `||a - b|| / ||b||` between two Jacobians
pub fn relative_error(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    let scale = b.norm();
    if scale > 0.0 {
        (a - b).norm() / scale
    } else {
        (a - b).norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Component, Polarization};
    use crate::grid::Pml;
    use crate::objective::{IntensitySum, ProbeIntensities};
    use crate::simulation::point_source;

    const OMEGA: f64 = 2.0 * std::f64::consts::PI * 200e12;

    fn design<O: Objective>(
        polarization: Polarization,
        objective: O,
    ) -> (Design<Simulation, O>, Vec<f64>) {
        let grid = Grid::new(8, 7, 5e-8).unwrap();
        let eps: Vec<f64> = (0..grid.len()).map(|k| 1.0 + ((k * 5 % 9) as f64) / 9.0).collect();
        let sim = Simulation::new(grid, Pml::new(2, 2), OMEGA, polarization, eps.clone()).unwrap();
        let source = point_source(&grid, 4, 3, Complex64::new(1e3, 0.0)).unwrap();
        (Design::new(sim, source, objective).unwrap(), eps)
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("reverse".parse::<DiffMode>().unwrap(), DiffMode::Reverse);
        assert_eq!("Forward".parse::<DiffMode>().unwrap(), DiffMode::Forward);
        assert!(matches!("numerical".parse::<DiffMode>().unwrap(), DiffMode::Numerical(_)));
        assert!(matches!("backward".parse::<DiffMode>(), Err(FdfdError::ModeMismatch(_))));
    }

    #[test]
    fn test_modes_agree_on_vector_objective() {
        let probes = ProbeIntensities::new(Component::Ez, vec![(1, 1), (4, 4), (6, 2)]);
        let (mut d, eps) = design(Polarization::Ez, probes);
        let reverse = d.jacobian(&eps, DiffMode::Reverse).unwrap();
        let forward = d.jacobian(&eps, DiffMode::Forward).unwrap();
        let fd = FiniteDifference {
            step: 1e-3,
            ..FiniteDifference::default()
        };
        let numerical = d.jacobian(&eps, DiffMode::Numerical(fd)).unwrap();
        assert_eq!(reverse.shape(), (3, 56));
        assert!(relative_error(&reverse, &forward) < 1e-8);
        assert!(relative_error(&reverse, &numerical) < 1e-4);
    }

    #[test]
    fn test_jacobian_closure_and_gradient() {
        let (mut d, eps) = design(Polarization::Hz, IntensitySum::all());
        let (value, grad) = d.value_and_gradient(&eps).unwrap();
        assert_eq!(value, d.value(&eps).unwrap());
        let from_gradient = d.gradient(&eps, DiffMode::Forward).unwrap();
        let scale = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        for (a, b) in grad.iter().zip(&from_gradient) {
            assert!((a - b).abs() < 1e-8 * scale);
        }
        let mut jac = jacobian(&mut d, DiffMode::Reverse);
        let j = jac(&eps).unwrap();
        assert_eq!(j.shape(), (1, 56));
    }

    #[test]
    fn test_forward_difference_scheme() {
        let (mut d, eps) = design(Polarization::Ez, IntensitySum::all());
        let central = FiniteDifference {
            step: 1e-3,
            scheme: DifferenceScheme::Central,
        };
        let forward = FiniteDifference {
            step: 1e-6,
            scheme: DifferenceScheme::Forward,
        };
        let central = d.jacobian(&eps, DiffMode::Numerical(central)).unwrap();
        let forward = d.jacobian(&eps, DiffMode::Numerical(forward)).unwrap();
        assert!(relative_error(&forward, &central) < 1e-3);
    }

    #[test]
    fn test_scalar_helpers_reject_vector_objectives() {
        let probes = ProbeIntensities::new(Component::Ez, vec![(1, 1), (2, 2)]);
        let (mut d, eps) = design(Polarization::Ez, probes);
        assert!(d.value(&eps).is_err());
        assert!(d.gradient(&eps, DiffMode::Reverse).is_err());
    }
}
