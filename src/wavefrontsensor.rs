//!
//! # Wavefront sensing
//!
//! Every sensor variant implements the [`WavefrontSensor`] capability
//! trait. A measurement splits into [`WavefrontSensor::propagate`]
//! (accumulate one exposure sub-step), [`WavefrontSensor::readout`] (apply
//! the detector noise model) and [`WavefrontSensor::process`] (turn the
//! exposure into a [`Slopes`] vector); [`WavefrontSensor::measure`] chains
//! the three for the common one-exposure-per-iteration case.
//!
//! `ShackHartmann<M>` is generic over the sensing `Model`, either
//! [`Geometric`] (local phase gradients) or [`Diffractive`] (subaperture
//! focal planes with photon and read noise); [`Pyramid`] is a focal-plane
//! quadrant sensor.

use serde::{Deserialize, Serialize};

use crate::{guidestar::GuideStar, phase::PhaseMap};

mod pyramid;
pub mod shackhartmann;
pub use pyramid::{Pyramid, PyramidBuilder};
pub use shackhartmann::{
    Diffractive, Geometric, LensletArray, Model, ShackHartmann, ShackHartmannBuilder,
};

#[derive(Debug, thiserror::Error)]
pub enum WavefrontSensorError {
    #[error(
        "detector binning is not integral: {n_fft}px focal plane into \
         {n_px_framelet}px framelets"
    )]
    Binning { n_fft: usize, n_px_framelet: usize },
    #[error("pupil sampling {n_px}px does not split into {n_side_lenslet} lenslets")]
    LensletSampling { n_px: usize, n_side_lenslet: usize },
    #[error("no illuminated subaperture above the {0} threshold")]
    NoValidLenslet(f64),
}

/// Wavefront measurement vector
///
/// The first half holds the X measurements of every subaperture, the second
/// half the Y measurements; masked subapertures are zero-filled so the
/// length is fixed by the sensor geometry for the life of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slopes(pub Vec<f64>);
impl Slopes {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
    pub fn rms(&self) -> f64 {
        if self.0.is_empty() {
            return 0f64;
        }
        (self.0.iter().map(|s| s * s).sum::<f64>() / self.0.len() as f64).sqrt()
    }
    /// Concatenates the measurements of several sensors
    pub fn concat(slopes: impl IntoIterator<Item = Slopes>) -> Slopes {
        Slopes(slopes.into_iter().flat_map(|s| s.0).collect())
    }
}

/// Detector noise model specifications
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseDataSheet {
    /// Detector integration time \[s\]
    pub exposure_time: f64,
    /// Read-out noise rms \[e-\]
    pub rms_read_out_noise: f64,
    /// Guide star flux \[photon/s\]
    pub n_photon: f64,
    /// Sky background flux \[photon/s\]
    pub n_background_photon: f64,
}
impl Default for NoiseDataSheet {
    fn default() -> Self {
        Self {
            exposure_time: 1e-3,
            rms_read_out_noise: 0f64,
            n_photon: 1e6,
            n_background_photon: 0f64,
        }
    }
}

/// Wavefront sensor capability trait
///
/// A sensor converts the incident wavefront into a fixed-length [`Slopes`]
/// vector; implementations may accumulate internal exposure state across
/// several [`WavefrontSensor::propagate`] sub-steps before a readout.
pub trait WavefrontSensor: Send + Sync {
    fn guide_star(&self) -> &GuideStar;
    /// Fixed measurement vector length
    fn n_slopes(&self) -> usize;
    /// Required phase sampling in pixels
    fn pupil_sampling(&self) -> usize;
    /// Clears the accumulated exposure
    fn reset(&mut self);
    /// Accumulates one exposure sub-step of the incident wavefront
    fn propagate(&mut self, phase: &PhaseMap);
    /// Applies the detector noise model to the accumulated exposure
    fn readout(&mut self);
    /// Processes the exposure into slopes
    fn process(&self) -> Slopes;
    /// Noise-free measurement that leaves the exposure state untouched,
    /// used for interaction matrix pokes and reference slopes
    fn measure_static(&self, phase: &PhaseMap) -> Slopes;
    /// Latest detector frame, if the sensor has one
    fn frame(&self) -> Option<&[f64]>;
    /// One full exposure: reset, propagate, readout, process
    fn measure(&mut self, phase: &PhaseMap) -> Slopes {
        self.reset();
        self.propagate(phase);
        self.readout();
        self.process()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slopes_concat() {
        let a = Slopes(vec![1., 2.]);
        let b = Slopes(vec![3.]);
        assert_eq!(Slopes::concat([a, b]).as_slice(), &[1., 2., 3.]);
    }

    #[test]
    fn slopes_rms() {
        let s = Slopes(vec![3., -3., 3., -3.]);
        assert!((s.rms() - 3.0).abs() < 1e-12);
    }
}
