//! Real-valued objectives of solved fields
//!
//! An objective maps [`Fields`] to one or more real outputs and supplies, per
//! output, the field cotangent `dJ/dRe(f) + i dJ/dIm(f)`. The cotangent is
//! all the adjoint rules need; forward mode contracts it with a field tangent.

use num_complex::Complex64;

use crate::error::{check_len, FdfdError, Result};
use crate::fields::{Component, Fields};

pub trait Objective {
    /// Length of the output vector; 1 for scalar objectives
    fn num_outputs(&self) -> usize {
        1
    }

    fn evaluate(&self, fields: &Fields) -> Result<Vec<f64>>;

    /// Cotangent of output `output` with respect to every field component.
    fn cotangent(&self, fields: &Fields, output: usize) -> Result<Fields>;
}

impl<O: Objective + ?Sized> Objective for Box<O> {
    fn num_outputs(&self) -> usize {
        (**self).num_outputs()
    }

    fn evaluate(&self, fields: &Fields) -> Result<Vec<f64>> {
        (**self).evaluate(fields)
    }

    fn cotangent(&self, fields: &Fields, output: usize) -> Result<Fields> {
        (**self).cotangent(fields, output)
    }
}

impl<O: Objective + ?Sized> Objective for &O {
    fn num_outputs(&self) -> usize {
        (**self).num_outputs()
    }

    fn evaluate(&self, fields: &Fields) -> Result<Vec<f64>> {
        (**self).evaluate(fields)
    }

    fn cotangent(&self, fields: &Fields, output: usize) -> Result<Fields> {
        (**self).cotangent(fields, output)
    }
}

fn check_output(objective: &impl Objective, output: usize) -> Result<()> {
    if output < objective.num_outputs() {
        Ok(())
    } else {
        Err(FdfdError::ShapeMismatch {
            expected: objective.num_outputs(),
            found: output + 1,
        })
    }
}

/// `sum |f|^2` over the selected components, or over all solved components.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntensitySum {
    components: Option<Vec<Component>>,
}

impl IntensitySum {
    /// Sum over every component of the polarization
    pub fn all() -> Self {
        Self { components: None }
    }

    pub fn of(components: &[Component]) -> Self {
        Self {
            components: Some(components.to_vec()),
        }
    }

    fn selected(&self, fields: &Fields) -> Vec<Component> {
        match &self.components {
            Some(list) => list.clone(),
            None => fields.components().to_vec(),
        }
    }
}

impl Objective for IntensitySum {
    fn evaluate(&self, fields: &Fields) -> Result<Vec<f64>> {
        let mut total = 0.0;
        for component in self.selected(fields) {
            total += fields.require(component)?.iter().map(|v| v.norm_sqr()).sum::<f64>();
        }
        Ok(vec![total])
    }

    fn cotangent(&self, fields: &Fields, output: usize) -> Result<Fields> {
        check_output(self, output)?;
        let mut seed = fields.zeros_like();
        for component in self.selected(fields) {
            let values = fields.require(component)?;
            if let Some(slot) = seed.get_mut(component) {
                for (g, v) in slot.iter_mut().zip(values) {
                    *g += 2.0 * v;
                }
            }
        }
        Ok(seed)
    }
}

/// `|sum w f|^2` for one component, e.g. coupling into a target mode profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeOverlap {
    pub component: Component,
    pub weights: Vec<Complex64>,
}

impl ModeOverlap {
    pub fn new(component: Component, weights: Vec<Complex64>) -> Self {
        Self { component, weights }
    }

    fn overlap(&self, fields: &Fields) -> Result<Complex64> {
        let values = fields.require(self.component)?;
        check_len(values.len(), self.weights.len())?;
        Ok(self.weights.iter().zip(values).map(|(w, f)| w * f).sum())
    }
}

impl Objective for ModeOverlap {
    fn evaluate(&self, fields: &Fields) -> Result<Vec<f64>> {
        Ok(vec![self.overlap(fields)?.norm_sqr()])
    }

    fn cotangent(&self, fields: &Fields, output: usize) -> Result<Fields> {
        check_output(self, output)?;
        let s = self.overlap(fields)?;
        let mut seed = fields.zeros_like();
        if let Some(slot) = seed.get_mut(self.component) {
            for (g, w) in slot.iter_mut().zip(&self.weights) {
                *g = 2.0 * s * w.conj();
            }
        }
        Ok(seed)
    }
}

/// `|f|^2` at each probe cell: one output per probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeIntensities {
    pub component: Component,
    pub probes: Vec<(usize, usize)>,
}

impl ProbeIntensities {
    pub fn new(component: Component, probes: Vec<(usize, usize)>) -> Self {
        Self { component, probes }
    }

    fn cell(&self, fields: &Fields, output: usize) -> Result<usize> {
        check_output(self, output)?;
        let (nx, ny) = fields.shape();
        let (ix, iy) = self.probes[output];
        if ix >= nx || iy >= ny {
            return Err(FdfdError::InvalidGridSpec(format!(
                "probe ({ix}, {iy}) lies outside the {nx}x{ny} grid"
            )));
        }
        Ok(ix * ny + iy)
    }
}

impl Objective for ProbeIntensities {
    fn num_outputs(&self) -> usize {
        self.probes.len()
    }

    fn evaluate(&self, fields: &Fields) -> Result<Vec<f64>> {
        let values = fields.require(self.component)?;
        (0..self.probes.len())
            .map(|i| Ok(values[self.cell(fields, i)?].norm_sqr()))
            .collect()
    }

    fn cotangent(&self, fields: &Fields, output: usize) -> Result<Fields> {
        let k = self.cell(fields, output)?;
        let value = fields.require(self.component)?[k];
        let mut seed = fields.zeros_like();
        if let Some(slot) = seed.get_mut(self.component) {
            slot[k] = 2.0 * value;
        }
        Ok(seed)
    }
}
