//! Simulation grid, PML widths and Yee-grid averaging

use nalgebra::{DMatrix, Scalar};
use serde::{Deserialize, Serialize};

use crate::error::{check_len, FdfdError, Result};

/// Uniform 2-D grid of `nx * ny` square cells of size `dl` (m).
///
/// Arrays over the grid are stored flat in row-major order, `k = ix * ny + iy`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub nx: usize,
    pub ny: usize,
    /// Cell size (m)
    pub dl: f64,
}

impl Grid {
    pub fn new(nx: usize, ny: usize, dl: f64) -> Result<Self> {
        if nx == 0 || ny == 0 {
            return Err(FdfdError::InvalidGridSpec(format!(
                "grid must have at least one cell per axis, got {nx}x{ny}"
            )));
        }
        if !(dl.is_finite() && dl > 0.0) {
            return Err(FdfdError::InvalidGridSpec(format!(
                "cell size must be positive, got {dl}"
            )));
        }
        Ok(Self { nx, ny, dl })
    }

    /// Total number of cells
    #[inline]
    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of cell `(ix, iy)`
    #[inline]
    pub fn index(&self, ix: usize, iy: usize) -> usize {
        ix * self.ny + iy
    }

    /// Inverse of [`Grid::index`]
    #[inline]
    pub fn coords(&self, k: usize) -> (usize, usize) {
        (k / self.ny, k % self.ny)
    }

    /// Flatten an `(nx, ny)` matrix into grid order.
    pub fn flatten<T: Scalar + Copy>(&self, array: &DMatrix<T>) -> Result<Vec<T>> {
        if array.nrows() != self.nx || array.ncols() != self.ny {
            return Err(FdfdError::InvalidGridSpec(format!(
                "array shape {}x{} does not match grid {}x{}",
                array.nrows(),
                array.ncols(),
                self.nx,
                self.ny
            )));
        }
        let mut flat = Vec::with_capacity(self.len());
        for ix in 0..self.nx {
            for iy in 0..self.ny {
                flat.push(array[(ix, iy)]);
            }
        }
        Ok(flat)
    }

    /// Reshape a flat grid array into an `(nx, ny)` matrix.
    pub fn to_matrix<T: Scalar + Copy>(&self, flat: &[T]) -> Result<DMatrix<T>> {
        check_len(self.len(), flat.len())?;
        Ok(DMatrix::from_fn(self.nx, self.ny, |ix, iy| flat[self.index(ix, iy)]))
    }

    /// Average with the neighbour at `ix - 1` (periodic), placing values on x-faces.
    pub fn average_x(&self, values: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        for ix in 0..self.nx {
            let prev = (ix + self.nx - 1) % self.nx;
            for iy in 0..self.ny {
                out[self.index(ix, iy)] =
                    0.5 * (values[self.index(ix, iy)] + values[self.index(prev, iy)]);
            }
        }
        out
    }

    /// Average with the neighbour at `iy - 1` (periodic), placing values on y-faces.
    pub fn average_y(&self, values: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        for ix in 0..self.nx {
            for iy in 0..self.ny {
                let prev = (iy + self.ny - 1) % self.ny;
                out[self.index(ix, iy)] =
                    0.5 * (values[self.index(ix, iy)] + values[self.index(ix, prev)]);
            }
        }
        out
    }

    /// Transpose of [`Grid::average_x`]: pulls face sensitivities back to cells.
    pub fn average_x_adjoint(&self, face: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        for ix in 0..self.nx {
            let next = (ix + 1) % self.nx;
            for iy in 0..self.ny {
                out[self.index(ix, iy)] =
                    0.5 * (face[self.index(ix, iy)] + face[self.index(next, iy)]);
            }
        }
        out
    }

    /// Transpose of [`Grid::average_y`].
    pub fn average_y_adjoint(&self, face: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        for ix in 0..self.nx {
            for iy in 0..self.ny {
                let next = (iy + 1) % self.ny;
                out[self.index(ix, iy)] =
                    0.5 * (face[self.index(ix, iy)] + face[self.index(ix, next)]);
            }
        }
        out
    }
}

/// PML thickness in cells on each boundary of an axis. Zero disables absorption on that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Pml {
    pub x: usize,
    pub y: usize,
}

impl Pml {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Check that both layers (one per side) fit inside the grid.
    pub fn validate(&self, grid: &Grid) -> Result<()> {
        if 2 * self.x >= grid.nx {
            return Err(FdfdError::InvalidGridSpec(format!(
                "PML of {} cells on each x boundary does not fit in nx = {}",
                self.x, grid.nx
            )));
        }
        if 2 * self.y >= grid.ny {
            return Err(FdfdError::InvalidGridSpec(format!(
                "PML of {} cells on each y boundary does not fit in ny = {}",
                self.y, grid.ny
            )));
        }
        Ok(())
    }
}

impl From<[usize; 2]> for Pml {
    fn from(widths: [usize; 2]) -> Self {
        Self::new(widths[0], widths[1])
    }
}
