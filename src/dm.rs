//!
//! # Deformable mirrors
//!
//! Two correctors share the [`DeformableMirror`] trait:
//!  - [`ZonalDm`]: a square grid of actuators with Gaussian influence
//!    functions and a finite stroke,
//!  - [`ModalDm`]: a Zernike modal corrector.
//!
//! Both map a command vector to a surface [`PhaseMap`] through a
//! precomputed influence matrix.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{mask::Pupil, phase::PhaseMap, Builder, FromBuilder, Result};

#[derive(Debug, thiserror::Error)]
pub enum DmError {
    #[error("expected {expected} actuator commands, got {got}")]
    CommandLength { expected: usize, got: usize },
    #[error("a deformable mirror needs at least 1 actuator, got {0}")]
    NoActuator(usize),
    #[error("actuator coupling must be in (0,1), got {0}")]
    Coupling(f64),
}

/// Kind tag used by configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmKind {
    Zonal,
    Modal,
}

/// A mirror surface and the number of saturated actuators that shaped it
#[derive(Debug, Clone)]
pub struct Figure {
    pub phase: PhaseMap,
    pub n_clipped: usize,
}

/// Wavefront corrector interface
pub trait DeformableMirror: Send + Sync {
    fn n_actuators(&self) -> usize;
    /// Mirror surface for a command vector, commands clipped to the
    /// stroke limit
    fn apply(&self, command: &[f64]) -> Result<Figure>;
    fn pupil_sampling(&self) -> usize;
}

// column k of `influence` is the surface of actuator k at unit command
fn surface(
    influence: &DMatrix<f64>,
    n_px: usize,
    delta: f64,
    stroke: Option<f64>,
    command: &[f64],
) -> Result<Figure> {
    if command.len() != influence.ncols() {
        return Err(DmError::CommandLength {
            expected: influence.ncols(),
            got: command.len(),
        }
        .into());
    }
    let mut n_clipped = 0;
    let clipped: DVector<f64> = DVector::from_iterator(
        command.len(),
        command.iter().map(|&c| match stroke {
            Some(s) if c.abs() > s => {
                n_clipped += 1;
                c.signum() * s
            }
            _ => c,
        }),
    );
    let values = influence * clipped;
    Ok(Figure {
        phase: PhaseMap::from_values(values.as_slice().to_vec(), n_px, delta),
        n_clipped,
    })
}

/// Gaussian influence function zonal mirror
pub struct ZonalDm {
    influence: DMatrix<f64>,
    n_actuator_side: usize,
    n_px: usize,
    delta: f64,
    stroke: Option<f64>,
}
impl ZonalDm {
    pub fn n_actuator_side(&self) -> usize {
        self.n_actuator_side
    }
    pub fn influence(&self) -> &DMatrix<f64> {
        &self.influence
    }
}
impl DeformableMirror for ZonalDm {
    fn n_actuators(&self) -> usize {
        self.n_actuator_side * self.n_actuator_side
    }
    fn apply(&self, command: &[f64]) -> Result<Figure> {
        surface(&self.influence, self.n_px, self.delta, self.stroke, command)
    }
    fn pupil_sampling(&self) -> usize {
        self.n_px
    }
}
impl FromBuilder for ZonalDm {
    type ComponentBuilder = ZonalDmBuilder;
}

/// [`ZonalDm`] builder
///
/// Default properties:
///  - 9x9 actuators over a 64px pupil
///  - 15% inter-actuator coupling
///  - unlimited stroke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonalDmBuilder {
    pub n_actuator_side: usize,
    pub n_px: usize,
    /// Pupil pixel scale \[m\]
    pub delta: f64,
    /// Influence at the neighboring actuator, sets the Gaussian width
    pub coupling: f64,
    /// Command clipping limit \[nm\], `None` for unlimited
    pub stroke: Option<f64>,
}
impl Default for ZonalDmBuilder {
    fn default() -> Self {
        Self {
            n_actuator_side: 9,
            n_px: 64,
            delta: 0.05,
            coupling: 0.15,
            stroke: None,
        }
    }
}
impl ZonalDmBuilder {
    pub fn n_actuator_side(self, n_actuator_side: usize) -> Self {
        Self {
            n_actuator_side,
            ..self
        }
    }
    pub fn sampling(self, n_px: usize, delta: f64) -> Self {
        Self { n_px, delta, ..self }
    }
    pub fn coupling(self, coupling: f64) -> Self {
        Self { coupling, ..self }
    }
    pub fn stroke(self, stroke: f64) -> Self {
        Self {
            stroke: Some(stroke),
            ..self
        }
    }
}
impl Builder for ZonalDmBuilder {
    type Component = ZonalDm;
    fn build(self) -> Result<ZonalDm> {
        if self.n_actuator_side == 0 {
            return Err(DmError::NoActuator(0).into());
        }
        if !(0f64..1f64).contains(&self.coupling) || self.coupling == 0f64 {
            return Err(DmError::Coupling(self.coupling).into());
        }
        let na = self.n_actuator_side;
        let n_px = self.n_px;
        // actuator pitch in pixels, actuators span the full aperture
        let pitch = (n_px - 1) as f64 / (na - 1).max(1) as f64;
        // Gaussian width from the coupling at one pitch:
        // exp(-(pitch/w)^2) = coupling
        let w = pitch / (-self.coupling.ln()).sqrt();
        let mut influence = DMatrix::<f64>::zeros(n_px * n_px, na * na);
        for ka in 0..na {
            for kb in 0..na {
                let (xc, yc) = (ka as f64 * pitch, kb as f64 * pitch);
                let mut column = influence.column_mut(ka * na + kb);
                for i in 0..n_px {
                    for j in 0..n_px {
                        let r2 = (i as f64 - xc).powi(2) + (j as f64 - yc).powi(2);
                        column[i * n_px + j] = (-r2 / (w * w)).exp();
                    }
                }
            }
        }
        log::info!("ZonalDm {0}x{0} actuators on {1}px", na, n_px);
        Ok(ZonalDm {
            influence,
            n_actuator_side: na,
            n_px,
            delta: self.delta,
            stroke: self.stroke,
        })
    }
}

/// Zernike modal mirror
pub struct ModalDm {
    influence: DMatrix<f64>,
    n_mode: usize,
    n_px: usize,
    delta: f64,
    stroke: Option<f64>,
}
impl ModalDm {
    pub fn n_mode(&self) -> usize {
        self.n_mode
    }
    pub fn influence(&self) -> &DMatrix<f64> {
        &self.influence
    }
}
impl DeformableMirror for ModalDm {
    fn n_actuators(&self) -> usize {
        self.n_mode
    }
    fn apply(&self, command: &[f64]) -> Result<Figure> {
        surface(&self.influence, self.n_px, self.delta, self.stroke, command)
    }
    fn pupil_sampling(&self) -> usize {
        self.n_px
    }
}
impl FromBuilder for ModalDm {
    type ComponentBuilder = ModalDmBuilder;
}

/// [`ModalDm`] builder
///
/// The mode basis is the Zernike polynomials up to the given radial
/// order, piston excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalDmBuilder {
    pub radial_order: u32,
    pub n_px: usize,
    pub delta: f64,
    pub stroke: Option<f64>,
}
impl Default for ModalDmBuilder {
    fn default() -> Self {
        Self {
            radial_order: 4,
            n_px: 64,
            delta: 0.05,
            stroke: None,
        }
    }
}
impl ModalDmBuilder {
    pub fn radial_order(self, radial_order: u32) -> Self {
        Self {
            radial_order,
            ..self
        }
    }
    pub fn sampling(self, n_px: usize, delta: f64) -> Self {
        Self { n_px, delta, ..self }
    }
    pub fn stroke(self, stroke: f64) -> Self {
        Self {
            stroke: Some(stroke),
            ..self
        }
    }
}
impl Builder for ModalDmBuilder {
    type Component = ModalDm;
    fn build(self) -> Result<ModalDm> {
        let n_px = self.n_px;
        let (j, n, m) = zernike::jnm(self.radial_order + 1);
        // polar coordinates on the unit disc
        let h = 0.5 * (n_px - 1) as f64;
        let (mut r, mut o): (Vec<f64>, Vec<f64>) = (
            Vec::with_capacity(n_px * n_px),
            Vec::with_capacity(n_px * n_px),
        );
        for i in 0..n_px {
            for jj in 0..n_px {
                let (x, y) = ((i as f64 - h) / h, (jj as f64 - h) / h);
                r.push(x.hypot(y).min(1f64));
                o.push(y.atan2(x));
            }
        }
        let modes: Vec<Vec<f64>> = j
            .into_iter()
            .zip(n.into_iter())
            .zip(m.into_iter())
            .skip(1) // no piston
            .map(|((j, n), m)| {
                r.iter()
                    .zip(&o)
                    .map(|(&r, &o)| zernike::zernike(j, n, m, r, o))
                    .collect()
            })
            .collect();
        if modes.is_empty() {
            return Err(DmError::NoActuator(0).into());
        }
        let n_mode = modes.len();
        let influence = DMatrix::<f64>::from_iterator(
            n_px * n_px,
            n_mode,
            modes.iter().flat_map(|m| m.iter().cloned()),
        );
        log::info!("ModalDm: {} Zernike modes on {}px", n_mode, n_px);
        Ok(ModalDm {
            influence,
            n_mode,
            n_px,
            delta: self.delta,
            stroke: self.stroke,
        })
    }
}
