//! Field components, polarizations and solved field sets

use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{check_len, FdfdError, Result};
use crate::grid::Grid;

/// Field component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Ex,
    Ey,
    Ez,
    Hx,
    Hy,
    Hz,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Ex => "Ex",
            Component::Ey => "Ey",
            Component::Ez => "Ez",
            Component::Hx => "Hx",
            Component::Hy => "Hy",
            Component::Hz => "Hz",
        };
        f.write_str(name)
    }
}

/// 2-D reduction of Maxwell's equations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarization {
    /// Out-of-plane electric field: solves for Ez, derives Hx and Hy
    #[default]
    Ez,
    /// Out-of-plane magnetic field: solves for Hz, derives Ex and Ey
    Hz,
}

impl Polarization {
    /// Components in output order; the last one is the unknown of the linear system.
    pub fn components(&self) -> [Component; 3] {
        match self {
            Polarization::Ez => [Component::Hx, Component::Hy, Component::Ez],
            Polarization::Hz => [Component::Ex, Component::Ey, Component::Hz],
        }
    }
}

impl FromStr for Polarization {
    type Err = FdfdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ez" | "tm" => Ok(Polarization::Ez),
            "hz" | "te" => Ok(Polarization::Hz),
            _ => Err(FdfdError::Unsupported(format!(
                "unknown polarization '{s}', expected ez or hz"
            ))),
        }
    }
}

/// Complex field components of one solve, each a flat grid array.
///
/// Also used for cotangents (reverse-mode seeds) and tangents of the fields,
/// which have the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fields {
    polarization: Polarization,
    nx: usize,
    ny: usize,
    values: [Vec<Complex64>; 3],
}

impl Fields {
    pub fn new(
        polarization: Polarization,
        grid: &Grid,
        values: [Vec<Complex64>; 3],
    ) -> Result<Self> {
        for v in &values {
            check_len(grid.len(), v.len())?;
        }
        Ok(Self {
            polarization,
            nx: grid.nx,
            ny: grid.ny,
            values,
        })
    }

    pub fn zeros(polarization: Polarization, grid: &Grid) -> Self {
        let zero = vec![Complex64::new(0.0, 0.0); grid.len()];
        Self {
            polarization,
            nx: grid.nx,
            ny: grid.ny,
            values: [zero.clone(), zero.clone(), zero],
        }
    }

    /// All-zero fields with the same polarization and shape
    pub fn zeros_like(&self) -> Self {
        let zero = vec![Complex64::new(0.0, 0.0); self.nx * self.ny];
        Self {
            polarization: self.polarization,
            nx: self.nx,
            ny: self.ny,
            values: [zero.clone(), zero.clone(), zero],
        }
    }

    pub fn polarization(&self) -> Polarization {
        self.polarization
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    pub fn components(&self) -> [Component; 3] {
        self.polarization.components()
    }

    fn slot(&self, component: Component) -> Option<usize> {
        self.components().iter().position(|&c| c == component)
    }

    /// Values of `component`, or `None` if this polarization does not carry it.
    pub fn get(&self, component: Component) -> Option<&[Complex64]> {
        self.slot(component).map(|i| self.values[i].as_slice())
    }

    pub fn get_mut(&mut self, component: Component) -> Option<&mut [Complex64]> {
        match self.slot(component) {
            Some(i) => Some(self.values[i].as_mut_slice()),
            None => None,
        }
    }

    /// Like [`Fields::get`] but errors for a component this polarization lacks.
    pub fn require(&self, component: Component) -> Result<&[Complex64]> {
        self.get(component).ok_or(FdfdError::MissingComponent {
            component,
            polarization: self.polarization,
        })
    }

    /// The out-of-plane component (Ez or Hz), the unknown of the linear system.
    pub fn primary(&self) -> &[Complex64] {
        &self.values[2]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Component, &[Complex64])> {
        self.components()
            .into_iter()
            .zip(self.values.iter().map(|v| v.as_slice()))
    }

    /// Components in output order, e.g. `(Hx, Hy, Ez)` for Ez polarization.
    pub fn into_parts(self) -> (Vec<Complex64>, Vec<Complex64>, Vec<Complex64>) {
        let [a, b, c] = self.values;
        (a, b, c)
    }

    /// `Re(sum conj(self) * other)` over all components.
    pub fn real_inner(&self, other: &Fields) -> f64 {
        self.values
            .iter()
            .zip(&other.values)
            .flat_map(|(a, b)| a.iter().zip(b))
            .map(|(a, b)| (a.conj() * b).re)
            .sum()
    }

    /// Sum of squared magnitudes over all components
    pub fn norm_sqr(&self) -> f64 {
        self.values.iter().flatten().map(|v| v.norm_sqr()).sum()
    }

    /// `component` reshaped to an `(nx, ny)` matrix for downstream plotting.
    pub fn to_matrix(&self, component: Component) -> Result<DMatrix<Complex64>> {
        let values = self.require(component)?;
        Ok(DMatrix::from_fn(self.nx, self.ny, |ix, iy| values[ix * self.ny + iy]))
    }
}
