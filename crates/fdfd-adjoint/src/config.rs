//! JSON configuration: solver settings and problem descriptions

use std::fs;
use std::path::Path;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::constants::omega_from_wavelength;
use crate::error::{FdfdError, Result};
use crate::fields::{Component, Polarization};
use crate::grid::{Grid, Pml};
use crate::jacobian::FiniteDifference;
use crate::nonlinear::{Kerr, NonlinearConfig, NonlinearSimulation, PermittivityModel, ScaledKerr};
use crate::objective::{IntensitySum, ModeOverlap, Objective, ProbeIntensities};
use crate::operators::OperatorCache;
use crate::pml::PmlProfile;
use crate::simulation::Simulation;
use crate::solver::SolverBackend;

/// Numerical settings shared by every solve of a problem
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub pml_profile: PmlProfile,
    pub backend: SolverBackend,
    pub nonlinear: NonlinearConfig,
    /// Step and scheme of numerical Jacobians
    pub numerical: FiniteDifference,
}

impl SolverConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Axis-aligned block of cells `x[0]..x[1]`, `y[0]..y[1]` with uniform permittivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: [usize; 2],
    pub y: [usize; 2],
    pub eps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermittivitySpec {
    pub background: f64,
    /// Painted in order, later regions overwrite earlier ones
    pub regions: Vec<Region>,
}

impl Default for PermittivitySpec {
    fn default() -> Self {
        Self {
            background: 1.0,
            regions: Vec::new(),
        }
    }
}

/// Point current source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub x: usize,
    pub y: usize,
    pub amplitude: f64,
    /// Phase in radians
    #[serde(default)]
    pub phase: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectiveSpec {
    IntensitySum {
        #[serde(default)]
        components: Option<Vec<Component>>,
    },
    ModeOverlap {
        component: Component,
        /// One `[re, im]` weight per cell, in grid order
        weights: Vec<Complex64>,
    },
    ProbeIntensities {
        component: Component,
        probes: Vec<[usize; 2]>,
    },
}

impl Default for ObjectiveSpec {
    fn default() -> Self {
        ObjectiveSpec::IntensitySum { components: None }
    }
}

impl ObjectiveSpec {
    pub fn build(&self) -> Box<dyn Objective> {
        match self {
            ObjectiveSpec::IntensitySum { components: None } => Box::new(IntensitySum::all()),
            ObjectiveSpec::IntensitySum {
                components: Some(list),
            } => Box::new(IntensitySum::of(list)),
            ObjectiveSpec::ModeOverlap { component, weights } => {
                Box::new(ModeOverlap::new(*component, weights.clone()))
            }
            ObjectiveSpec::ProbeIntensities { component, probes } => Box::new(ProbeIntensities::new(
                *component,
                probes.iter().map(|p| (p[0], p[1])).collect(),
            )),
        }
    }
}

/// Kerr nonlinearity of a problem
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum KerrSpec {
    /// `eps_lin + 3 chi3 |E|^2`
    Kerr { chi3: f64 },
    /// `eps_lin (1 + 3 chi3 |E|^2)`
    Scaled { chi3: f64 },
}

impl PermittivityModel for KerrSpec {
    fn permittivity(&self, linear: f64, intensity: f64) -> f64 {
        match *self {
            KerrSpec::Kerr { chi3 } => Kerr { chi3 }.permittivity(linear, intensity),
            KerrSpec::Scaled { chi3 } => ScaledKerr { chi3 }.permittivity(linear, intensity),
        }
    }

    fn intensity_derivative(&self, linear: f64, intensity: f64) -> f64 {
        match *self {
            KerrSpec::Kerr { chi3 } => Kerr { chi3 }.intensity_derivative(linear, intensity),
            KerrSpec::Scaled { chi3 } => {
                ScaledKerr { chi3 }.intensity_derivative(linear, intensity)
            }
        }
    }

    fn linear_derivative(&self, linear: f64, intensity: f64) -> f64 {
        match *self {
            KerrSpec::Kerr { chi3 } => Kerr { chi3 }.linear_derivative(linear, intensity),
            KerrSpec::Scaled { chi3 } => ScaledKerr { chi3 }.linear_derivative(linear, intensity),
        }
    }
}

/// Complete description of one FDFD problem, as read by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub nx: usize,
    pub ny: usize,
    /// Cell size (m)
    pub dl: f64,
    /// Angular frequency (rad/s); takes precedence over `wavelength`
    #[serde(default)]
    pub omega: Option<f64>,
    /// Free-space wavelength (m)
    #[serde(default)]
    pub wavelength: Option<f64>,
    #[serde(default)]
    pub pml: [usize; 2],
    #[serde(default)]
    pub polarization: Polarization,
    #[serde(default)]
    pub permittivity: PermittivitySpec,
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub objective: ObjectiveSpec,
    #[serde(default)]
    pub kerr: Option<KerrSpec>,
    #[serde(default)]
    pub solver: SolverConfig,
}

impl ProblemSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn grid(&self) -> Result<Grid> {
        Grid::new(self.nx, self.ny, self.dl)
    }

    pub fn pml(&self) -> Pml {
        Pml::from(self.pml)
    }

    pub fn omega(&self) -> Result<f64> {
        match (self.omega, self.wavelength) {
            (Some(omega), _) => Ok(omega),
            (None, Some(wavelength)) if wavelength > 0.0 => Ok(omega_from_wavelength(wavelength)),
            (None, Some(wavelength)) => Err(FdfdError::InvalidGridSpec(format!(
                "wavelength must be positive, got {wavelength}"
            ))),
            (None, None) => Err(FdfdError::InvalidGridSpec(
                "either omega or wavelength must be given".to_string(),
            )),
        }
    }

    /// Flat permittivity array painted from the background and regions
    pub fn permittivity(&self, grid: &Grid) -> Result<Vec<f64>> {
        let mut eps = vec![self.permittivity.background; grid.len()];
        for region in &self.permittivity.regions {
            let [x0, x1] = region.x;
            let [y0, y1] = region.y;
            if x0 > x1 || y0 > y1 || x1 > grid.nx || y1 > grid.ny {
                return Err(FdfdError::InvalidGridSpec(format!(
                    "region x {x0}..{x1}, y {y0}..{y1} does not fit the {}x{} grid",
                    grid.nx, grid.ny
                )));
            }
            for ix in x0..x1 {
                for iy in y0..y1 {
                    eps[grid.index(ix, iy)] = region.eps;
                }
            }
        }
        Ok(eps)
    }

    /// Sum of all point sources as a flat array
    pub fn source(&self, grid: &Grid) -> Result<Vec<Complex64>> {
        let mut source = vec![Complex64::new(0.0, 0.0); grid.len()];
        for s in &self.sources {
            if s.x >= grid.nx || s.y >= grid.ny {
                return Err(FdfdError::InvalidGridSpec(format!(
                    "source at ({}, {}) lies outside the {}x{} grid",
                    s.x, s.y, grid.nx, grid.ny
                )));
            }
            source[grid.index(s.x, s.y)] += Complex64::from_polar(s.amplitude, s.phase);
        }
        Ok(source)
    }

    pub fn linear_solver(&self, cache: &mut OperatorCache) -> Result<Simulation> {
        let grid = self.grid()?;
        let eps = self.permittivity(&grid)?;
        let sim = Simulation::with_cache(
            grid,
            self.pml(),
            self.omega()?,
            self.polarization,
            eps,
            &self.solver.pml_profile,
            cache,
        )?;
        Ok(sim.with_backend(self.solver.backend))
    }

    /// Nonlinear handle, or `None` when the problem has no Kerr term.
    pub fn nonlinear_solver(
        &self,
        cache: &mut OperatorCache,
    ) -> Result<Option<NonlinearSimulation<KerrSpec>>> {
        let Some(kerr) = self.kerr else {
            return Ok(None);
        };
        if self.polarization != Polarization::Ez {
            return Err(FdfdError::Unsupported(
                "nonlinear solves support ez polarization only".to_string(),
            ));
        }
        let grid = self.grid()?;
        let eps = self.permittivity(&grid)?;
        let sim = NonlinearSimulation::with_cache(
            grid,
            self.pml(),
            self.omega()?,
            eps,
            kerr,
            &self.solver.pml_profile,
            cache,
        )?;
        Ok(Some(sim.with_backend(self.solver.backend).with_config(self.solver.nonlinear)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jacobian::DifferenceScheme;
    use crate::nonlinear::IterationScheme;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const PROBLEM: &str = r#"{
        "nx": 20,
        "ny": 16,
        "dl": 5e-8,
        "wavelength": 1.5e-6,
        "pml": [4, 3],
        "polarization": "ez",
        "permittivity": {
            "background": 1.0,
            "regions": [{ "x": [8, 12], "y": [0, 16], "eps": 12.0 }]
        },
        "sources": [{ "x": 5, "y": 8, "amplitude": 1000.0 }],
        "objective": { "type": "probe_intensities", "component": "ez", "probes": [[14, 8]] },
        "kerr": { "model": "scaled", "chi3": 2000.0 },
        "solver": { "nonlinear": { "scheme": "born", "max_iterations": 80 } }
    }"#;

    #[test]
    fn test_solver_config_defaults() {
        let config = SolverConfig::from_json("{}").unwrap();
        assert_eq!(config, SolverConfig::default());
        assert_eq!(config.backend, SolverBackend::SparseLu);
        assert_eq!(config.nonlinear.max_iterations, 50);
        assert_eq!(config.nonlinear.tolerance, 1e-10);
        assert_eq!(config.nonlinear.scheme, IterationScheme::Newton);
        assert_eq!(config.numerical.step, 1e-4);
        assert_eq!(config.numerical.scheme, DifferenceScheme::Central);
        assert_eq!(config.pml_profile.order, 3.0);
    }

    #[test]
    fn test_parse_problem() {
        let spec = ProblemSpec::from_json(PROBLEM).unwrap();
        let grid = spec.grid().unwrap();
        assert_eq!((grid.nx, grid.ny), (20, 16));
        assert_eq!(spec.pml(), Pml::new(4, 3));
        assert!((spec.omega().unwrap() - omega_from_wavelength(1.5e-6)).abs() < 1.0);
        assert_eq!(spec.kerr, Some(KerrSpec::Scaled { chi3: 2000.0 }));
        assert_eq!(spec.solver.nonlinear.scheme, IterationScheme::Born);
        assert_eq!(spec.solver.nonlinear.max_iterations, 80);
        assert_eq!(spec.solver.nonlinear.tolerance, 1e-10);

        let eps = spec.permittivity(&grid).unwrap();
        assert_eq!(eps[grid.index(9, 3)], 12.0);
        assert_eq!(eps[grid.index(7, 3)], 1.0);
        let source = spec.source(&grid).unwrap();
        assert_eq!(source[grid.index(5, 8)], Complex64::new(1000.0, 0.0));
        assert_eq!(spec.objective.build().num_outputs(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PROBLEM.as_bytes()).unwrap();
        let spec = ProblemSpec::from_file(file.path()).unwrap();
        assert_eq!(spec.nx, 20);
        assert!(matches!(
            ProblemSpec::from_file("/nonexistent/problem.json"),
            Err(FdfdError::Io(_))
        ));
        assert!(matches!(ProblemSpec::from_json("{"), Err(FdfdError::Json(_))));
    }

    #[test]
    fn test_builds_solvers() {
        let spec = ProblemSpec::from_json(PROBLEM).unwrap();
        let mut cache = OperatorCache::new();
        let linear = spec.linear_solver(&mut cache).unwrap();
        let nonlinear = spec.nonlinear_solver(&mut cache).unwrap().unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(linear.permittivity(), nonlinear.permittivity());
        assert_eq!(nonlinear.config().max_iterations, 80);

        let mut hz = spec.clone();
        hz.polarization = Polarization::Hz;
        assert!(matches!(hz.nonlinear_solver(&mut cache), Err(FdfdError::Unsupported(_))));
        hz.kerr = None;
        assert!(hz.nonlinear_solver(&mut cache).unwrap().is_none());
    }

    #[test]
    fn test_invalid_problems() {
        let mut spec = ProblemSpec::from_json(PROBLEM).unwrap();
        spec.permittivity.regions[0].x = [8, 21];
        assert!(spec.permittivity(&spec.grid().unwrap()).is_err());

        let mut spec = ProblemSpec::from_json(PROBLEM).unwrap();
        spec.wavelength = None;
        assert!(spec.omega().is_err());
        spec.omega = Some(1e15);
        assert_eq!(spec.omega().unwrap(), 1e15);

        let mut spec = ProblemSpec::from_json(PROBLEM).unwrap();
        spec.pml = [10, 3];
        assert!(matches!(
            spec.linear_solver(&mut OperatorCache::new()),
            Err(FdfdError::InvalidGridSpec(_))
        ));
    }
}
