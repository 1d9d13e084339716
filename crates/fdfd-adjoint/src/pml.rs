//! Perfectly matched layer: complex coordinate stretching
//!
//! Inside the layer the derivative along an axis is divided by
//! `s = 1 - i sigma / (omega eps0)`, where the conductivity `sigma` grows
//! polynomially from the interior interface to the outer boundary. Outside
//! the layer `s` is exactly 1.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::constants::{EPSILON_0, ETA_0};

/// Conductivity grading of the absorbing layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmlProfile {
    /// Polynomial order `m` of the grading (typically 3-4)
    pub order: f64,
    /// Target natural log of the normal-incidence reflection coefficient
    pub ln_reflection: f64,
}

impl Default for PmlProfile {
    fn default() -> Self {
        Self {
            order: 3.0,
            ln_reflection: -30.0,
        }
    }
}

impl PmlProfile {
    /// sigma_max = -(m+1) ln(R) / (2 eta0 d) for a layer `thickness` meters deep
    pub fn sigma_max(&self, thickness: f64) -> f64 {
        -(self.order + 1.0) * self.ln_reflection / (2.0 * ETA_0 * thickness)
    }

    /// Conductivity at depth `depth` into a layer of `thickness` meters
    pub fn sigma(&self, depth: f64, thickness: f64) -> f64 {
        self.sigma_max(thickness) * (depth / thickness).powf(self.order)
    }

    /// Stretch factor at depth `depth` into the layer
    pub fn stretch(&self, depth: f64, thickness: f64, omega: f64) -> Complex64 {
        Complex64::new(1.0, -self.sigma(depth, thickness) / (omega * EPSILON_0))
    }
}

/// Which Yee sub-grid a derivative samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staggering {
    /// Forward difference, sampled half a cell after the cell center
    Forward,
    /// Backward difference, sampled at the cell center
    Backward,
}

/// Stretch factors along one axis of `n` cells with `n_pml` absorbing cells per side.
pub fn stretch_factors(
    n: usize,
    n_pml: usize,
    dl: f64,
    omega: f64,
    staggering: Staggering,
    profile: &PmlProfile,
) -> Vec<Complex64> {
    let mut factors = vec![Complex64::new(1.0, 0.0); n];
    if n_pml == 0 {
        return factors;
    }

    let thickness = n_pml as f64 * dl;
    let offset = match staggering {
        Staggering::Forward => 0.5,
        Staggering::Backward => 0.0,
    };

    for (i, factor) in factors.iter_mut().enumerate() {
        // Depth into the layer in cells, measured at the sampling point
        let depth = if i < n_pml {
            n_pml as f64 - i as f64 - offset
        } else if i >= n - n_pml {
            (i - (n - n_pml)) as f64 + offset
        } else {
            continue;
        };
        *factor = profile.stretch(depth * dl, thickness, omega);
    }

    factors
}
