//! Finite-difference derivative operators with PML stretching
//!
//! The four first-difference operators act on flat grid arrays with periodic
//! wrap-around; each row is divided by `dl` and by the stretch factor of its
//! cell. They depend only on grid, frequency and PML, never on permittivity,
//! so one set is shared by every solve at that frequency.
//!
//! Matrices are faer compressed-column matrices, the same storage the sparse
//! LU factors, so assembly, products and solves share one representation.

use std::collections::HashMap;
use std::sync::Arc;

use faer::complex_native::c64;
use faer::sparse::SparseColMat;
use faer::Col;
use num_complex::Complex64;
use tracing::debug;

use crate::error::{FdfdError, Result};
use crate::grid::{Grid, Pml};
use crate::pml::{stretch_factors, PmlProfile, Staggering};

/// Complex sparse matrix used for every operator and system matrix
pub type SparseMatrix = SparseColMat<usize, c64>;

/// Build from `(row, col, value)` triplets; duplicates are summed.
pub fn from_triplets(
    nrows: usize,
    ncols: usize,
    triplets: &[(usize, usize, c64)],
) -> Result<SparseMatrix> {
    SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
        .map_err(|e| FdfdError::SparseAssembly(format!("{e:?}")))
}

pub fn diagonal(values: &[Complex64]) -> Result<SparseMatrix> {
    let n = values.len();
    let triplets: Vec<_> = values
        .iter()
        .enumerate()
        .map(|(k, &v)| (k, k, c64::from(v)))
        .collect();
    from_triplets(n, n, &triplets)
}

/// Stored `(row, col, value)` entries, column by column
pub fn triplets(a: &SparseMatrix) -> impl Iterator<Item = (usize, usize, Complex64)> + '_ {
    (0..a.ncols()).flat_map(move |j| {
        a.row_indices_of_col(j)
            .zip(a.values_of_col(j))
            .map(move |(i, &v)| (i, j, Complex64::from(v)))
    })
}

/// `A x`
pub fn apply(a: &SparseMatrix, x: &[Complex64]) -> Vec<Complex64> {
    from_col(&(a * &to_col(x)))
}

/// `A^H x`
pub fn apply_adjoint(a: &SparseMatrix, x: &[Complex64]) -> Vec<Complex64> {
    from_col(&(a.adjoint() * &to_col(x)))
}

fn to_col(x: &[Complex64]) -> Col<c64> {
    Col::from_fn(x.len(), |i| c64::from(x[i]))
}

fn from_col(y: &Col<c64>) -> Vec<Complex64> {
    (0..y.nrows()).map(|i| Complex64::from(y.read(i))).collect()
}

/// Axis a difference is taken along
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

/// Stretched derivative operators for one `(grid, omega, pml)` combination
#[derive(Debug, Clone)]
pub struct DerivativeOperators {
    pub dxf: SparseMatrix,
    pub dxb: SparseMatrix,
    pub dyf: SparseMatrix,
    pub dyb: SparseMatrix,
    /// Dxf Dxb + Dyf Dyb, the stretched Laplacian used by the Ez system
    pub laplacian: SparseMatrix,
}

impl DerivativeOperators {
    pub fn new(grid: &Grid, pml: &Pml, omega: f64, profile: &PmlProfile) -> Result<Self> {
        let sxf = stretch_factors(grid.nx, pml.x, grid.dl, omega, Staggering::Forward, profile);
        let sxb = stretch_factors(grid.nx, pml.x, grid.dl, omega, Staggering::Backward, profile);
        let syf = stretch_factors(grid.ny, pml.y, grid.dl, omega, Staggering::Forward, profile);
        let syb = stretch_factors(grid.ny, pml.y, grid.dl, omega, Staggering::Backward, profile);

        let dxf = difference(grid, Axis::X, Staggering::Forward, &sxf)?;
        let dxb = difference(grid, Axis::X, Staggering::Backward, &sxb)?;
        let dyf = difference(grid, Axis::Y, Staggering::Forward, &syf)?;
        let dyb = difference(grid, Axis::Y, Staggering::Backward, &syb)?;
        let laplacian = &(&dxf * &dxb) + &(&dyf * &dyb);

        debug!(
            nx = grid.nx,
            ny = grid.ny,
            pml_x = pml.x,
            pml_y = pml.y,
            laplacian_nnz = laplacian.compute_nnz(),
            "built derivative operators"
        );

        Ok(Self {
            dxf,
            dxb,
            dyf,
            dyb,
            laplacian,
        })
    }
}

/// Periodic first difference along `axis`, rows scaled by `1 / (dl * s)`.
fn difference(
    grid: &Grid,
    axis: Axis,
    staggering: Staggering,
    stretch: &[Complex64],
) -> Result<SparseMatrix> {
    let mut triplets = Vec::with_capacity(2 * grid.len());
    for ix in 0..grid.nx {
        for iy in 0..grid.ny {
            let row = grid.index(ix, iy);
            let (along, n) = match axis {
                Axis::X => (ix, grid.nx),
                Axis::Y => (iy, grid.ny),
            };
            let scale = stretch[along].inv() / grid.dl;

            // Forward couples to the next cell, backward to the previous one
            let neighbour = match staggering {
                Staggering::Forward => (along + 1) % n,
                Staggering::Backward => (along + n - 1) % n,
            };
            let col = match axis {
                Axis::X => grid.index(neighbour, iy),
                Axis::Y => grid.index(ix, neighbour),
            };
            let sign = match staggering {
                Staggering::Forward => 1.0,
                Staggering::Backward => -1.0,
            };
            triplets.push((row, row, c64::from(-sign * scale)));
            triplets.push((row, col, c64::from(sign * scale)));
        }
    }
    from_triplets(grid.len(), grid.len(), &triplets)
}

/// Cache key: everything the operators depend on, floats compared by bit pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct OperatorKey {
    nx: usize,
    ny: usize,
    dl: u64,
    omega: u64,
    pml: Pml,
    order: u64,
    ln_reflection: u64,
}

impl OperatorKey {
    fn new(grid: &Grid, pml: &Pml, omega: f64, profile: &PmlProfile) -> Self {
        Self {
            nx: grid.nx,
            ny: grid.ny,
            dl: grid.dl.to_bits(),
            omega: omega.to_bits(),
            pml: *pml,
            order: profile.order.to_bits(),
            ln_reflection: profile.ln_reflection.to_bits(),
        }
    }
}

/// Shares derivative operators between simulations with identical grid, frequency and PML.
#[derive(Debug, Default)]
pub struct OperatorCache {
    entries: HashMap<OperatorKey, Arc<DerivativeOperators>>,
}

impl OperatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &mut self,
        grid: &Grid,
        pml: &Pml,
        omega: f64,
        profile: &PmlProfile,
    ) -> Result<Arc<DerivativeOperators>> {
        let key = OperatorKey::new(grid, pml, omega, profile);
        if let Some(ops) = self.entries.get(&key) {
            debug!("derivative operator cache hit");
            return Ok(Arc::clone(ops));
        }
        let ops = Arc::new(DerivativeOperators::new(grid, pml, omega, profile)?);
        self.entries.insert(key, Arc::clone(&ops));
        Ok(ops)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Entry `(row, col)`, zero when not stored
#[cfg(test)]
pub(crate) fn entry(a: &SparseMatrix, row: usize, col: usize) -> Complex64 {
    a.get(row, col)
        .map_or(Complex64::new(0.0, 0.0), |&v| Complex64::from(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OMEGA: f64 = 2.0 * std::f64::consts::PI * 200e12;

    fn ops(nx: usize, ny: usize, pml: Pml) -> (Grid, DerivativeOperators) {
        let grid = Grid::new(nx, ny, 0.1).unwrap();
        let ops = DerivativeOperators::new(&grid, &pml, OMEGA, &PmlProfile::default()).unwrap();
        (grid, ops)
    }

    #[test]
    fn test_difference_of_constant_vanishes() {
        let (grid, ops) = ops(6, 5, Pml::new(2, 1));
        let ones = vec![Complex64::new(1.0, 0.0); grid.len()];
        for d in [&ops.dxf, &ops.dxb, &ops.dyf, &ops.dyb, &ops.laplacian] {
            assert!(apply(d, &ones).iter().all(|v| v.norm() < 1e-9));
        }
    }

    #[test]
    fn test_forward_difference_without_pml() {
        let (grid, ops) = ops(4, 3, Pml::default());
        // f = ix, so Dxf f = 1/dl except at the periodic seam
        let f: Vec<Complex64> = (0..grid.len())
            .map(|k| Complex64::new(grid.coords(k).0 as f64, 0.0))
            .collect();
        let d = apply(&ops.dxf, &f);
        assert!((d[grid.index(1, 2)] - Complex64::new(10.0, 0.0)).norm() < 1e-9);
        assert!((d[grid.index(3, 0)] - Complex64::new(-30.0, 0.0)).norm() < 1e-9);
        let d = apply(&ops.dxb, &f);
        assert!((d[grid.index(2, 1)] - Complex64::new(10.0, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn test_backward_is_negative_transpose_without_pml() {
        let (grid, ops) = ops(5, 4, Pml::default());
        for i in 0..grid.len() {
            for j in 0..grid.len() {
                assert_eq!(entry(&ops.dxb, i, j), -entry(&ops.dxf, j, i));
                assert_eq!(entry(&ops.dyb, i, j), -entry(&ops.dyf, j, i));
            }
        }
    }

    #[test]
    fn test_rows_outside_pml_are_unstretched() {
        let (grid, ops) = ops(12, 10, Pml::new(3, 2));
        let row = grid.index(6, 5);
        assert_eq!(entry(&ops.dxf, row, row), Complex64::new(-10.0, 0.0));
        let pml_row = grid.index(0, 5);
        assert!(entry(&ops.dxf, pml_row, pml_row).im != 0.0);
    }

    #[test]
    fn test_adjoint_apply_is_conjugate_transpose() {
        // <A x, y> == <x, A^H y>
        let (grid, ops) = ops(5, 4, Pml::new(1, 1));
        let x: Vec<Complex64> = (0..grid.len())
            .map(|k| Complex64::new((k as f64).sin(), 0.5 * k as f64))
            .collect();
        let y: Vec<Complex64> = (0..grid.len())
            .map(|k| Complex64::new(1.0 - 0.1 * k as f64, (k as f64 * 0.3).cos()))
            .collect();
        let ax = apply(&ops.laplacian, &x);
        let ahy = apply_adjoint(&ops.laplacian, &y);
        let lhs: Complex64 = ax.iter().zip(&y).map(|(a, b)| a.conj() * b).sum();
        let rhs: Complex64 = x.iter().zip(&ahy).map(|(a, b)| a.conj() * b).sum();
        assert!((lhs - rhs).norm() < 1e-9 * lhs.norm());
    }

    #[test]
    fn test_laplacian_stencil_without_pml() {
        let (grid, ops) = ops(5, 4, Pml::default());
        let row = grid.index(2, 2);
        // 1 / dl^2 with dl = 0.1
        assert!((entry(&ops.laplacian, row, row) - Complex64::new(-400.0, 0.0)).norm() < 1e-9);
        let right = grid.index(3, 2);
        assert!((entry(&ops.laplacian, row, right) - Complex64::new(100.0, 0.0)).norm() < 1e-9);
        assert_eq!(ops.laplacian.compute_nnz(), 5 * grid.len());
        let d = diagonal(&[Complex64::new(2.0, 1.0), Complex64::new(0.0, -1.0)]).unwrap();
        assert_eq!(triplets(&d).count(), 2);
        assert_eq!(entry(&d, 1, 1), Complex64::new(0.0, -1.0));
        assert_eq!(entry(&d, 0, 1), Complex64::new(0.0, 0.0));
    }

    #[test]
    fn test_cache_reuses_operators() {
        let grid = Grid::new(8, 8, 1e-8).unwrap();
        let profile = PmlProfile::default();
        let mut cache = OperatorCache::new();
        let a = cache.get_or_build(&grid, &Pml::new(2, 2), OMEGA, &profile).unwrap();
        let b = cache.get_or_build(&grid, &Pml::new(2, 2), OMEGA, &profile).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.get_or_build(&grid, &Pml::new(2, 2), 2.0 * OMEGA, &profile).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        let d = cache.get_or_build(&grid, &Pml::new(1, 2), OMEGA, &profile).unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
        assert_eq!(cache.len(), 3);
    }
}
