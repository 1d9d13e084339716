//! Direct factorization of the system matrix
//!
//! A [`Factorization`] is computed once per system matrix and then reused for
//! any number of forward (`A x = b`) and adjoint (`A^H y = g`) solves, which
//! is what makes a reverse-mode gradient cost a single extra back-substitution.

use faer::complex_native::c64;
use faer::prelude::*;
use faer::sparse::linalg::solvers::Lu;
use nalgebra::{DMatrix, DVector, Dyn, LU};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{check_len, FdfdError, Result};
use crate::operators::{apply, apply_adjoint, triplets, SparseMatrix};

/// Largest accepted `||A x - b|| / ||b||` after a solve.
///
/// A backward-stable LU of a singular matrix still returns finite numbers;
/// only the forward residual shows the system was not actually solved.
pub const RESIDUAL_TOLERANCE: f64 = 1e-6;

/// Which direct solver factors the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverBackend {
    /// Sparse LU with fill-reducing ordering
    #[default]
    SparseLu,
    /// Dense partial-pivot LU; only sensible for small grids, mainly for cross-checking
    DenseLu,
}

enum Factors {
    Sparse(Lu<usize, c64>),
    Dense(LU<Complex64, Dyn, Dyn>),
}

/// A factored square system ready for repeated solves.
///
/// Keeps the matrix alongside its factors so every solve can be checked
/// against the system it claims to satisfy.
pub struct Factorization {
    matrix: SparseMatrix,
    factors: Factors,
}

impl std::fmt::Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.factors {
            Factors::Sparse(_) => "Sparse",
            Factors::Dense(_) => "Dense",
        };
        write!(f, "Factorization::{kind}(n = {})", self.dim())
    }
}

impl Factorization {
    pub fn new(matrix: &SparseMatrix, backend: SolverBackend) -> Result<Self> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(FdfdError::IllConditionedSystem(format!(
                "system matrix is {}x{}, expected square",
                n,
                matrix.ncols()
            )));
        }
        if matrix
            .values()
            .iter()
            .any(|v| !(v.re.is_finite() && v.im.is_finite()))
        {
            return Err(FdfdError::IllConditionedSystem(
                "system matrix has non-finite entries".to_string(),
            ));
        }
        debug!(n, nnz = matrix.compute_nnz(), ?backend, "factoring system matrix");

        let factors = match backend {
            SolverBackend::SparseLu => {
                let lu = matrix.sp_lu().map_err(|e| {
                    FdfdError::IllConditionedSystem(format!("sparse LU failed: {e:?}"))
                })?;
                Factors::Sparse(lu)
            }
            SolverBackend::DenseLu => {
                let mut dense = DMatrix::<Complex64>::zeros(n, n);
                for (i, j, v) in triplets(matrix) {
                    dense[(i, j)] += v;
                }
                let lu = dense.lu();
                check_pivots(&lu, n)?;
                Factors::Dense(lu)
            }
        };
        Ok(Self {
            matrix: matrix.clone(),
            factors,
        })
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &SparseMatrix {
        &self.matrix
    }

    /// Solve `A x = b`.
    pub fn solve(&self, rhs: &[Complex64]) -> Result<Vec<Complex64>> {
        check_len(self.dim(), rhs.len())?;
        trace!(n = rhs.len(), "forward solve");
        let x = match &self.factors {
            Factors::Sparse(lu) => {
                let mut b = to_faer(rhs);
                lu.solve_in_place(b.as_mut());
                from_faer(&b)
            }
            Factors::Dense(lu) => {
                let b = DVector::from_column_slice(rhs);
                let x = lu.solve(&b).ok_or_else(|| {
                    FdfdError::IllConditionedSystem("dense LU solve failed".to_string())
                })?;
                x.as_slice().to_vec()
            }
        };
        self.verify(x, rhs, false)
    }

    /// Solve the adjoint system `A^H y = g`.
    pub fn solve_adjoint(&self, rhs: &[Complex64]) -> Result<Vec<Complex64>> {
        check_len(self.dim(), rhs.len())?;
        trace!(n = rhs.len(), "adjoint solve");
        let y = match &self.factors {
            Factors::Sparse(lu) => {
                let mut b = to_faer(rhs);
                lu.solve_conj_transpose_in_place(b.as_mut());
                from_faer(&b)
            }
            Factors::Dense(lu) => {
                // P A = L U, so A^H = U^H L^H P
                let b = DVector::from_column_slice(rhs);
                let failed = || {
                    FdfdError::IllConditionedSystem("dense adjoint solve failed".to_string())
                };
                let z = lu.u().ad_solve_upper_triangular(&b).ok_or_else(failed)?;
                let mut w = lu.l().ad_solve_lower_triangular(&z).ok_or_else(failed)?;
                lu.p().inv_permute_rows(&mut w);
                w.as_slice().to_vec()
            }
        };
        self.verify(y, rhs, true)
    }

    /// Reject a solution that is non-finite or leaves a large relative residual.
    fn verify(
        &self,
        x: Vec<Complex64>,
        rhs: &[Complex64],
        adjoint: bool,
    ) -> Result<Vec<Complex64>> {
        if !x.iter().all(|v| v.is_finite()) {
            return Err(FdfdError::IllConditionedSystem(
                "solution contains non-finite values".to_string(),
            ));
        }
        let rhs_norm = norm(rhs);
        if rhs_norm == 0.0 {
            return Ok(x);
        }
        let ax = if adjoint {
            apply_adjoint(&self.matrix, &x)
        } else {
            apply(&self.matrix, &x)
        };
        let residual = ax
            .iter()
            .zip(rhs)
            .map(|(u, v)| (u - v).norm_sqr())
            .sum::<f64>()
            .sqrt()
            / rhs_norm;
        trace!(residual, adjoint, "solve residual");
        if residual.is_finite() && residual <= RESIDUAL_TOLERANCE {
            Ok(x)
        } else {
            warn!(residual, adjoint, "solve does not satisfy the system");
            Err(FdfdError::IllConditionedSystem(format!(
                "relative residual {residual:.3e} after solve exceeds {RESIDUAL_TOLERANCE:e}"
            )))
        }
    }
}

/// Smallest to largest `|U_ii|` must exceed `n` machine epsilons.
fn check_pivots(lu: &LU<Complex64, Dyn, Dyn>, n: usize) -> Result<()> {
    let pivots: Vec<f64> = lu.u().diagonal().iter().map(|v| v.norm()).collect();
    let largest = pivots.iter().copied().fold(0.0, f64::max);
    let smallest = pivots.iter().copied().fold(f64::INFINITY, f64::min);
    if n > 0 && !(smallest > n as f64 * f64::EPSILON * largest) {
        return Err(FdfdError::IllConditionedSystem(format!(
            "vanishing pivot: min |U_ii| = {smallest:.3e}, max |U_ii| = {largest:.3e}"
        )));
    }
    Ok(())
}

fn norm(v: &[Complex64]) -> f64 {
    v.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

fn to_faer(values: &[Complex64]) -> Mat<c64> {
    Mat::from_fn(values.len(), 1, |i, _| c64::from(values[i]))
}

fn from_faer(mat: &Mat<c64>) -> Vec<Complex64> {
    (0..mat.nrows())
        .map(|i| Complex64::from(mat.read(i, 0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{diagonal, from_triplets};

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn matrix(n: usize, entries: Vec<(usize, usize, Complex64)>) -> SparseMatrix {
        let triplets: Vec<_> = entries
            .into_iter()
            .map(|(i, j, v)| (i, j, c64::from(v)))
            .collect();
        from_triplets(n, n, &triplets).unwrap()
    }

    fn system() -> SparseMatrix {
        // Diagonally dominant, non-Hermitian tridiagonal
        let n = 12;
        let mut entries = Vec::new();
        for i in 0..n {
            entries.push((i, i, c(4.0 + i as f64 * 0.1, 1.0 - 0.2 * i as f64)));
            if i + 1 < n {
                entries.push((i, i + 1, c(-1.0, 0.5)));
                entries.push((i + 1, i, c(0.3, -1.2)));
            }
        }
        entries.push((0, n - 1, c(0.0, 0.7)));
        matrix(n, entries)
    }

    fn rhs(n: usize) -> Vec<Complex64> {
        (0..n)
            .map(|i| c((i as f64).sin(), (i as f64 * 0.5).cos()))
            .collect()
    }

    fn residual(a: &SparseMatrix, x: &[Complex64], b: &[Complex64], adjoint: bool) -> f64 {
        let ax = if adjoint {
            apply_adjoint(a, x)
        } else {
            apply(a, x)
        };
        ax.iter().zip(b).map(|(u, v)| (u - v).norm()).fold(0.0, f64::max)
    }

    #[test]
    fn test_forward_and_adjoint_solves() {
        let a = system();
        let b = rhs(a.nrows());
        for backend in [SolverBackend::SparseLu, SolverBackend::DenseLu] {
            let lu = Factorization::new(&a, backend).unwrap();
            let x = lu.solve(&b).unwrap();
            assert!(residual(&a, &x, &b, false) < 1e-12, "{:?}", backend);
            let y = lu.solve_adjoint(&b).unwrap();
            assert!(residual(&a, &y, &b, true) < 1e-12, "{:?}", backend);
        }
    }

    #[test]
    fn test_backends_agree() {
        let a = system();
        let b = rhs(a.nrows());
        let sparse = Factorization::new(&a, SolverBackend::SparseLu)
            .unwrap()
            .solve(&b)
            .unwrap();
        let dense = Factorization::new(&a, SolverBackend::DenseLu)
            .unwrap()
            .solve(&b)
            .unwrap();
        for (s, d) in sparse.iter().zip(&dense) {
            assert!((s - d).norm() < 1e-12);
        }
    }

    #[test]
    fn test_singular_dense_system_rejected() {
        let a = matrix(2, vec![(0, 0, c(1.0, 0.0)), (1, 0, c(2.0, 0.0))]);
        assert!(matches!(
            Factorization::new(&a, SolverBackend::DenseLu),
            Err(FdfdError::IllConditionedSystem(_))
        ));
    }

    #[test]
    fn test_near_singular_dense_pivot_rejected() {
        // Second pivot is a single ulp of the first
        let a = matrix(
            2,
            vec![
                (0, 0, c(1.0, 0.0)),
                (0, 1, c(1.0, 0.0)),
                (1, 0, c(1.0, 0.0)),
                (1, 1, c(1.0 + f64::EPSILON, 0.0)),
            ],
        );
        assert!(matches!(
            Factorization::new(&a, SolverBackend::DenseLu),
            Err(FdfdError::IllConditionedSystem(_))
        ));
    }

    #[test]
    fn test_inconsistent_singular_solve_rejected() {
        // Periodic second difference: constants span the null space, and a
        // point load has a nonzero mean, so no x satisfies A x = b.
        let n = 8;
        let mut entries = Vec::new();
        for i in 0..n {
            entries.push((i, i, c(-2.0, 0.0)));
            entries.push((i, (i + 1) % n, c(1.0, 0.0)));
            entries.push((i, (i + n - 1) % n, c(1.0, 0.0)));
        }
        let a = matrix(n, entries);
        let mut b = vec![c(0.0, 0.0); n];
        b[3] = c(1.0, 0.0);
        for backend in [SolverBackend::SparseLu, SolverBackend::DenseLu] {
            let outcome = Factorization::new(&a, backend).and_then(|lu| {
                lu.solve(&b)?;
                lu.solve_adjoint(&b)
            });
            assert!(
                matches!(outcome, Err(FdfdError::IllConditionedSystem(_))),
                "{:?}",
                backend
            );
        }
    }

    #[test]
    fn test_zero_rhs_gives_zero_solution() {
        let lu = Factorization::new(&system(), SolverBackend::SparseLu).unwrap();
        let x = lu.solve(&vec![c(0.0, 0.0); 12]).unwrap();
        assert!(x.iter().all(|v| v.norm() == 0.0));
    }

    #[test]
    fn test_non_finite_matrix_rejected() {
        let a = diagonal(&[c(1.0, 0.0), c(f64::NAN, 0.0)]).unwrap();
        assert!(matches!(
            Factorization::new(&a, SolverBackend::SparseLu),
            Err(FdfdError::IllConditionedSystem(_))
        ));
    }

    #[test]
    fn test_rhs_length_checked() {
        let lu = Factorization::new(&system(), SolverBackend::SparseLu).unwrap();
        assert!(matches!(
            lu.solve(&[c(1.0, 0.0)]),
            Err(FdfdError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_backend_serde_names() {
        let b: SolverBackend = serde_json::from_str("\"dense_lu\"").unwrap();
        assert_eq!(b, SolverBackend::DenseLu);
        assert_eq!(
            serde_json::to_string(&SolverBackend::SparseLu).unwrap(),
            "\"sparse_lu\""
        );
    }
}
