//! Closed-form derivative rules for the FDFD solve
//!
//! A solve maps the permittivity grid to complex fields. [`Differentiable`]
//! exposes the two primitives a host autodiff engine needs to treat that map
//! as a single operation: the vector-Jacobian product (reverse mode, one
//! adjoint solve with `A^H`) and the Jacobian-vector product (forward mode,
//! one tangent solve with `A`). Both reuse the factorization of the forward
//! solve and never mutate it.

use std::sync::Arc;

use num_complex::Complex64;
use tracing::trace;

use crate::error::{check_len, Result};
use crate::fields::{Fields, Polarization};
use crate::grid::Grid;
use crate::maxwell::MaxwellOperator;
use crate::operators::DerivativeOperators;
use crate::solver::Factorization;

/// A solved operating point that can be differentiated with respect to permittivity.
pub trait Differentiable {
    /// The solved fields
    fn fields(&self) -> &Fields;

    /// Gradient of `J` with respect to every permittivity cell, given the
    /// field cotangent `seed = dJ/dRe(f) + i dJ/dIm(f)`.
    fn vector_jacobian_product(&self, seed: &Fields) -> Result<Vec<f64>>;

    /// Field tangent along the permittivity direction `direction`.
    fn jacobian_vector_product(&self, direction: &[f64]) -> Result<Fields>;
}

/// Record of a linear solve `A(eps) x = b`.
#[derive(Debug, Clone)]
pub struct LinearSolution {
    grid: Grid,
    omega: f64,
    polarization: Polarization,
    ops: Arc<DerivativeOperators>,
    eps: Vec<f64>,
    x: Vec<Complex64>,
    lu: Arc<Factorization>,
    fields: Fields,
}

impl LinearSolution {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        grid: Grid,
        omega: f64,
        polarization: Polarization,
        ops: Arc<DerivativeOperators>,
        eps: Vec<f64>,
        x: Vec<Complex64>,
        lu: Arc<Factorization>,
        fields: Fields,
    ) -> Self {
        Self {
            grid,
            omega,
            polarization,
            ops,
            eps,
            x,
            lu,
            fields,
        }
    }

    fn operator(&self) -> MaxwellOperator<'_> {
        MaxwellOperator::new(&self.ops, &self.grid, self.omega, self.polarization)
    }

    /// Permittivity the solve was performed with
    pub fn permittivity(&self) -> &[f64] {
        &self.eps
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }
}

impl Differentiable for LinearSolution {
    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn vector_jacobian_product(&self, seed: &Fields) -> Result<Vec<f64>> {
        let op = self.operator();
        let (cotangent, explicit) = op.pullback(&self.eps, &self.x, seed)?;
        let lambda = self.lu.solve_adjoint(&cotangent)?;
        trace!("adjoint field solved");
        let mut grad = op.matrix_gradient(&self.eps, &self.x, &lambda)?;
        for (g, e) in grad.iter_mut().zip(&explicit) {
            *g += e;
        }
        Ok(grad)
    }

    fn jacobian_vector_product(&self, direction: &[f64]) -> Result<Fields> {
        check_len(self.grid.len(), direction.len())?;
        let op = self.operator();
        let rhs: Vec<Complex64> = op
            .matrix_tangent(&self.eps, &self.x, direction)?
            .into_iter()
            .map(|v| -v)
            .collect();
        let x_dot = self.lu.solve(&rhs)?;
        op.fields_tangent(&self.eps, &self.x, &x_dot, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Pml;
    use crate::simulation::{point_source, Simulation};

    const OMEGA: f64 = 2.0 * std::f64::consts::PI * 200e12;

    fn solve(polarization: Polarization, eps: &[f64]) -> (Simulation, LinearSolution) {
        let grid = Grid::new(10, 9, 5e-8).unwrap();
        let mut sim =
            Simulation::new(grid, Pml::new(2, 2), OMEGA, polarization, eps.to_vec()).unwrap();
        let source = point_source(&grid, 5, 4, Complex64::new(1e3, 0.0)).unwrap();
        let sol = sim.solve_linearized(&source).unwrap();
        (sim, sol)
    }

    fn eps() -> Vec<f64> {
        (0..90).map(|k| 1.0 + 0.5 * ((k * 37 % 11) as f64) / 11.0).collect()
    }

    #[test]
    fn test_vjp_and_jvp_are_consistent() {
        // <seed, J d> == <J^T seed, d>
        for polarization in [Polarization::Ez, Polarization::Hz] {
            let (_, sol) = solve(polarization, &eps());
            let seed = sol.fields().clone();
            let direction: Vec<f64> = (0..90).map(|k| (k as f64 * 0.37).sin()).collect();
            let tangent = sol.jacobian_vector_product(&direction).unwrap();
            let grad = sol.vector_jacobian_product(&seed).unwrap();
            let lhs = seed.real_inner(&tangent);
            let rhs: f64 = grad.iter().zip(&direction).map(|(g, d)| g * d).sum();
            assert!(
                (lhs - rhs).abs() < 1e-8 * lhs.abs().max(rhs.abs()),
                "{:?}: {lhs} vs {rhs}",
                polarization
            );
        }
    }

    #[test]
    fn test_jvp_matches_finite_difference() {
        for polarization in [Polarization::Ez, Polarization::Hz] {
            let base = eps();
            let (mut sim, sol) = solve(polarization, &base);
            let direction: Vec<f64> = (0..90).map(|k| ((k % 7) as f64 - 3.0) / 3.0).collect();
            let tangent = sol.jacobian_vector_product(&direction).unwrap();

            let h = 1e-5;
            let source = point_source(sim.grid(), 5, 4, Complex64::new(1e3, 0.0)).unwrap();
            let shifted = |sign: f64, sim: &mut Simulation| {
                let e: Vec<f64> = base
                    .iter()
                    .zip(&direction)
                    .map(|(e, d)| e + sign * h * d)
                    .collect();
                sim.set_permittivity(&e).unwrap();
                sim.solve(&source).unwrap()
            };
            let plus = shifted(1.0, &mut sim);
            let minus = shifted(-1.0, &mut sim);
            let scale = tangent.norm_sqr().sqrt();
            for (((_, t), (_, p)), (_, m)) in tangent.iter().zip(plus.iter()).zip(minus.iter()) {
                for k in 0..t.len() {
                    let fd = (p[k] - m[k]) / (2.0 * h);
                    assert!((fd - t[k]).norm() < 1e-5 * scale, "{:?}", polarization);
                }
            }
        }
    }

    #[test]
    fn test_vjp_leaves_solution_untouched() {
        let (_, sol) = solve(Polarization::Hz, &eps());
        let before = sol.fields().clone();
        let _ = sol.vector_jacobian_product(&before).unwrap();
        let _ = sol.jacobian_vector_product(&vec![1.0; 90]).unwrap();
        assert_eq!(sol.fields(), &before);
        assert_eq!(sol.permittivity(), eps().as_slice());
    }
}
