//! Maxwell operator assembly for the two 2-D polarizations
//!
//! Ez polarization (unknown Ez):
//!   A = -(1/mu0) (Dxf Dxb + Dyf Dyb) - omega^2 eps0 diag(eps)
//!   Hx = -1/(i omega mu0) Dyb Ez,  Hy = 1/(i omega mu0) Dxb Ez
//!
//! Hz polarization (unknown Hz):
//!   A = (1/eps0) (Dxf diag(1/eps_xx) Dxb + Dyf diag(1/eps_yy) Dyb) + omega^2 mu0 I
//!   Ex = 1/(i omega eps0) Dyb Hz / eps_yy,  Ey = -1/(i omega eps0) Dxb Hz / eps_xx
//!
//! Both right-hand sides are `i omega` times the source current. `A` is
//! affine in `eps` (Ez) or in `1/eps` on the Yee faces (Hz), so its derivative
//! with respect to one cell touches only that cell's stencil. The methods
//! below expose exactly the pieces the adjoint and tangent rules need.
//!
//! Cotangent convention: a real objective `J` of complex fields `f` has
//! cotangent `g = dJ/dRe(f) + i dJ/dIm(f)`, so `dJ = Re(sum conj(g) df)`.

use faer::complex_native::c64;
use faer::Scale;
use num_complex::Complex64;
use tracing::debug;

use crate::constants::{EPSILON_0, MU_0};
use crate::error::{check_len, FdfdError, Result};
use crate::fields::{Component, Fields, Polarization};
use crate::grid::Grid;
use crate::operators::{apply, apply_adjoint, diagonal, DerivativeOperators, SparseMatrix};

/// Permittivity on the Yee faces used by the Hz system
struct FacePermittivity {
    xx: Vec<f64>,
    yy: Vec<f64>,
}

/// Assembler for one grid, frequency and polarization.
#[derive(Debug, Clone, Copy)]
pub struct MaxwellOperator<'a> {
    pub ops: &'a DerivativeOperators,
    pub grid: &'a Grid,
    pub omega: f64,
    pub polarization: Polarization,
}

impl<'a> MaxwellOperator<'a> {
    pub fn new(
        ops: &'a DerivativeOperators,
        grid: &'a Grid,
        omega: f64,
        polarization: Polarization,
    ) -> Self {
        Self {
            ops,
            grid,
            omega,
            polarization,
        }
    }

    /// omega^2 eps0: coupling of the Ez system to a unit change of one cell's permittivity
    pub fn permittivity_coupling(&self) -> f64 {
        self.omega * self.omega * EPSILON_0
    }

    /// 1/(i omega eps0)
    fn e_from_h(&self) -> Complex64 {
        Complex64::new(0.0, -1.0 / (self.omega * EPSILON_0))
    }

    /// 1/(i omega mu0)
    fn h_from_e(&self) -> Complex64 {
        Complex64::new(0.0, -1.0 / (self.omega * MU_0))
    }

    fn faces(&self, eps: &[f64]) -> Result<FacePermittivity> {
        let xx = self.grid.average_x(eps);
        let yy = self.grid.average_y(eps);
        if let Some(k) = xx.iter().chain(&yy).position(|&e| e == 0.0 || !e.is_finite()) {
            let (ix, iy) = self.grid.coords(k % self.grid.len());
            return Err(FdfdError::IllConditionedSystem(format!(
                "face permittivity near cell ({ix}, {iy}) is zero or non-finite"
            )));
        }
        Ok(FacePermittivity { xx, yy })
    }

    /// System matrix `A(eps)`.
    pub fn assemble(&self, eps: &[f64]) -> Result<SparseMatrix> {
        check_len(self.grid.len(), eps.len())?;
        let matrix = match self.polarization {
            Polarization::Ez => {
                let k0 = self.permittivity_coupling();
                let mass: Vec<Complex64> = eps
                    .iter()
                    .map(|&e| Complex64::new(-k0 * e, 0.0))
                    .collect();
                let curl_curl = Scale(c64::new(-1.0 / MU_0, 0.0)) * &self.ops.laplacian;
                &curl_curl + &diagonal(&mass)?
            }
            Polarization::Hz => {
                let faces = self.faces(eps)?;
                let inv_xx = diagonal(&inverse(&faces.xx))?;
                let inv_yy = diagonal(&inverse(&faces.yy))?;
                let dxx = &self.ops.dxf * &(&inv_xx * &self.ops.dxb);
                let dyy = &self.ops.dyf * &(&inv_yy * &self.ops.dyb);
                let w2_mu = Complex64::new(self.omega * self.omega * MU_0, 0.0);
                let mass = diagonal(&vec![w2_mu; self.grid.len()])?;
                let curl_curl = Scale(c64::new(1.0 / EPSILON_0, 0.0)) * &(&dxx + &dyy);
                &curl_curl + &mass
            }
        };
        debug!(
            polarization = ?self.polarization,
            n = matrix.nrows(),
            nnz = matrix.compute_nnz(),
            "assembled system matrix"
        );
        Ok(matrix)
    }

    /// Right-hand side `b = i omega source`.
    pub fn excitation(&self, source: &[Complex64]) -> Result<Vec<Complex64>> {
        check_len(self.grid.len(), source.len())?;
        let iw = Complex64::new(0.0, self.omega);
        Ok(source.iter().map(|&s| iw * s).collect())
    }

    /// All field components from the solved unknown `x`.
    pub fn fields(&self, eps: &[f64], x: &[Complex64]) -> Result<Fields> {
        let values = match self.polarization {
            Polarization::Ez => {
                let c = self.h_from_e();
                let hx = apply(&self.ops.dyb, x).into_iter().map(|v| -c * v).collect();
                let hy = apply(&self.ops.dxb, x).into_iter().map(|v| c * v).collect();
                [hx, hy, x.to_vec()]
            }
            Polarization::Hz => {
                let faces = self.faces(eps)?;
                let c = self.e_from_h();
                let ex = apply(&self.ops.dyb, x)
                    .into_iter()
                    .zip(&faces.yy)
                    .map(|(v, &e)| c * v / e)
                    .collect();
                let ey = apply(&self.ops.dxb, x)
                    .into_iter()
                    .zip(&faces.xx)
                    .map(|(v, &e)| -c * v / e)
                    .collect();
                [ex, ey, x.to_vec()]
            }
        };
        Fields::new(self.polarization, self.grid, values)
    }

    /// Pull a field cotangent back to the unknown.
    ///
    /// Returns the cotangent of `x` and the explicit gradient with respect to
    /// `eps` through the secondary components (nonzero only for Hz).
    pub fn pullback(
        &self,
        eps: &[f64],
        x: &[Complex64],
        seed: &Fields,
    ) -> Result<(Vec<Complex64>, Vec<f64>)> {
        let [a, b, primary] = self.polarization.components();
        let (ga, gb, gx) = (seed.require(a)?, seed.require(b)?, seed.require(primary)?);
        let n = self.grid.len();

        match self.polarization {
            Polarization::Ez => {
                let c = self.h_from_e();
                let from_hx: Vec<Complex64> = ga.iter().map(|&g| (-c).conj() * g).collect();
                let from_hy: Vec<Complex64> = gb.iter().map(|&g| c.conj() * g).collect();
                let dyb = apply_adjoint(&self.ops.dyb, &from_hx);
                let dxb = apply_adjoint(&self.ops.dxb, &from_hy);
                let cot = (0..n).map(|k| gx[k] + dyb[k] + dxb[k]).collect();
                Ok((cot, vec![0.0; n]))
            }
            Polarization::Hz => {
                let faces = self.faces(eps)?;
                let c = self.e_from_h();
                let dy_x = apply(&self.ops.dyb, x);
                let dx_x = apply(&self.ops.dxb, x);

                let from_ex: Vec<Complex64> = (0..n)
                    .map(|k| (c / faces.yy[k]).conj() * ga[k])
                    .collect();
                let from_ey: Vec<Complex64> = (0..n)
                    .map(|k| (-c / faces.xx[k]).conj() * gb[k])
                    .collect();
                let dyb = apply_adjoint(&self.ops.dyb, &from_ex);
                let dxb = apply_adjoint(&self.ops.dxb, &from_ey);
                let cot = (0..n).map(|k| gx[k] + dyb[k] + dxb[k]).collect();

                // Ex = c Dyb x / eps_yy, so dEx/deps_yy = -c Dyb x / eps_yy^2
                let grad_yy: Vec<f64> = (0..n)
                    .map(|k| (ga[k].conj() * (-c * dy_x[k] / (faces.yy[k] * faces.yy[k]))).re)
                    .collect();
                let grad_xx: Vec<f64> = (0..n)
                    .map(|k| (gb[k].conj() * (c * dx_x[k] / (faces.xx[k] * faces.xx[k]))).re)
                    .collect();
                Ok((cot, self.faces_to_cells(&grad_xx, &grad_yy)))
            }
        }
    }

    /// `-Re(lambda^H (dA/d eps_k) x)` for every cell `k`.
    pub fn matrix_gradient(
        &self,
        eps: &[f64],
        x: &[Complex64],
        lambda: &[Complex64],
    ) -> Result<Vec<f64>> {
        let n = self.grid.len();
        match self.polarization {
            Polarization::Ez => {
                // dA/d eps_k = -omega^2 eps0 e_k e_k^T
                let k0 = self.permittivity_coupling();
                Ok((0..n).map(|k| k0 * (lambda[k].conj() * x[k]).re).collect())
            }
            Polarization::Hz => {
                let faces = self.faces(eps)?;
                // dA/d(1/eps_xx)_k = (1/eps0) Dxf e_k e_k^T Dxb
                let lx = apply_adjoint(&self.ops.dxf, lambda);
                let ly = apply_adjoint(&self.ops.dyf, lambda);
                let dx_x = apply(&self.ops.dxb, x);
                let dy_x = apply(&self.ops.dyb, x);
                let grad_xx: Vec<f64> = (0..n)
                    .map(|k| {
                        let d_inv = -(lx[k].conj() * dx_x[k]).re / EPSILON_0;
                        -d_inv / (faces.xx[k] * faces.xx[k])
                    })
                    .collect();
                let grad_yy: Vec<f64> = (0..n)
                    .map(|k| {
                        let d_inv = -(ly[k].conj() * dy_x[k]).re / EPSILON_0;
                        -d_inv / (faces.yy[k] * faces.yy[k])
                    })
                    .collect();
                Ok(self.faces_to_cells(&grad_xx, &grad_yy))
            }
        }
    }

    /// `(dA[delta]) x`: directional derivative of `A` along `delta`, applied to `x`.
    pub fn matrix_tangent(
        &self,
        eps: &[f64],
        x: &[Complex64],
        delta: &[f64],
    ) -> Result<Vec<Complex64>> {
        check_len(self.grid.len(), delta.len())?;
        match self.polarization {
            Polarization::Ez => {
                let k0 = self.permittivity_coupling();
                Ok(x.iter().zip(delta).map(|(&v, &d)| -k0 * d * v).collect())
            }
            Polarization::Hz => {
                let faces = self.faces(eps)?;
                let dxx = self.grid.average_x(delta);
                let dyy = self.grid.average_y(delta);
                let n = self.grid.len();
                let dx_x = apply(&self.ops.dxb, x);
                let dy_x = apply(&self.ops.dyb, x);
                let wx: Vec<Complex64> = (0..n)
                    .map(|k| dx_x[k] * (-dxx[k] / (faces.xx[k] * faces.xx[k])))
                    .collect();
                let wy: Vec<Complex64> = (0..n)
                    .map(|k| dy_x[k] * (-dyy[k] / (faces.yy[k] * faces.yy[k])))
                    .collect();
                let tx = apply(&self.ops.dxf, &wx);
                let ty = apply(&self.ops.dyf, &wy);
                Ok((0..n).map(|k| (tx[k] + ty[k]) / EPSILON_0).collect())
            }
        }
    }

    /// Tangent of all field components given the unknown's tangent `x_dot`
    /// and the permittivity direction `delta`.
    pub fn fields_tangent(
        &self,
        eps: &[f64],
        x: &[Complex64],
        x_dot: &[Complex64],
        delta: &[f64],
    ) -> Result<Fields> {
        let mut tangent = self.fields(eps, x_dot)?;
        if self.polarization == Polarization::Hz {
            let faces = self.faces(eps)?;
            let dxx = self.grid.average_x(delta);
            let dyy = self.grid.average_y(delta);
            let c = self.e_from_h();
            let dy_x = apply(&self.ops.dyb, x);
            let dx_x = apply(&self.ops.dxb, x);
            if let Some(ex) = tangent.get_mut(Component::Ex) {
                for (k, v) in ex.iter_mut().enumerate() {
                    *v += -c * dy_x[k] * (dyy[k] / (faces.yy[k] * faces.yy[k]));
                }
            }
            if let Some(ey) = tangent.get_mut(Component::Ey) {
                for (k, v) in ey.iter_mut().enumerate() {
                    *v += c * dx_x[k] * (dxx[k] / (faces.xx[k] * faces.xx[k]));
                }
            }
        }
        Ok(tangent)
    }

    /// Chain face sensitivities back through the Yee averaging
    fn faces_to_cells(&self, grad_xx: &[f64], grad_yy: &[f64]) -> Vec<f64> {
        let from_x = self.grid.average_x_adjoint(grad_xx);
        let from_y = self.grid.average_y_adjoint(grad_yy);
        from_x.iter().zip(&from_y).map(|(a, b)| a + b).collect()
    }
}

fn inverse(values: &[f64]) -> Vec<Complex64> {
    values.iter().map(|&e| Complex64::new(1.0 / e, 0.0)).collect()
}
