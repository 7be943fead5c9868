//!
//! # Science camera
//!
//! Forms the point spread function of the residual wavefront at the
//! science wavelength and tracks the Strehl ratio, both instantaneous
//! and long-exposure. The Strehl ratio is the on-axis PSF peak
//! normalized by the diffraction-limited peak of the same pupil.

use rustfft::num_complex::Complex64;

use crate::{fft, mask::Pupil, phase::PhaseMap, Builder, FromBuilder, Result};

/// Long exposure accumulator
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Exposure {
    /// Long exposure PSF, `n_fft x n_fft`
    pub image: Vec<f64>,
    pub n_fft: usize,
    pub n_frames: usize,
    /// Strehl ratio of the long exposure PSF
    pub strehl: f64,
}

/// Science path imager
pub struct ScienceCamera {
    pupil: Pupil,
    wavelength: f64,
    n_fft: usize,
    dl_peak: f64,
    image: Vec<f64>,
    n_frames: usize,
    last_strehl: f64,
}
impl ScienceCamera {
    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }
    /// Strehl ratio of the latest accumulated frame
    pub fn instantaneous_strehl(&self) -> f64 {
        self.last_strehl
    }
    /// Strehl ratio of the long exposure so far
    pub fn strehl(&self) -> f64 {
        if self.n_frames == 0 {
            return 0f64;
        }
        let peak = self.image.iter().cloned().fold(0f64, f64::max);
        peak / (self.dl_peak * self.n_frames as f64)
    }
    fn psf(&self, residual: &PhaseMap) -> Vec<f64> {
        let n_px = self.pupil.n_px();
        let phs2rad = 2.0 * std::f64::consts::PI * 1e-9 / self.wavelength;
        let field: Vec<Complex64> = self
            .pupil
            .weights()
            .iter()
            .zip(residual.as_slice())
            .map(|(w, p)| {
                let phi = p * phs2rad;
                Complex64::new(w * phi.cos(), w * phi.sin())
            })
            .collect();
        fft::focal_plane_intensity(&field, n_px, self.n_fft)
    }
    /// Adds one residual wavefront to the long exposure
    pub fn accumulate(&mut self, residual: &PhaseMap) {
        let frame = self.psf(residual);
        let peak = frame.iter().cloned().fold(0f64, f64::max);
        self.last_strehl = peak / self.dl_peak;
        self.image
            .iter_mut()
            .zip(&frame)
            .for_each(|(a, b)| *a += b);
        self.n_frames += 1;
    }
    /// Closes the exposure
    ///
    /// The returned image is normalized per frame so calling `finalize`
    /// repeatedly yields the same exposure.
    pub fn finalize(&self) -> Exposure {
        let gain = if self.n_frames > 0 {
            1f64 / self.n_frames as f64
        } else {
            0f64
        };
        Exposure {
            image: self.image.iter().map(|p| p * gain).collect(),
            n_fft: self.n_fft,
            n_frames: self.n_frames,
            strehl: self.strehl(),
        }
    }
    pub fn reset(&mut self) {
        self.image.fill(0f64);
        self.n_frames = 0;
        self.last_strehl = 0f64;
    }
}
impl FromBuilder for ScienceCamera {
    type ComponentBuilder = ScienceCameraBuilder;
}

/// [`ScienceCamera`] builder
///
/// Default properties:
///  - wavelength: 1.65e-6m (H band)
///  - 2x focal plane padding
#[derive(Debug, Clone)]
pub struct ScienceCameraBuilder {
    pub wavelength: f64,
    pub osf: usize,
    pupil: Option<Pupil>,
}
impl Default for ScienceCameraBuilder {
    fn default() -> Self {
        Self {
            wavelength: 1.65e-6,
            osf: 2,
            pupil: None,
        }
    }
}
impl ScienceCameraBuilder {
    pub fn wavelength(self, wavelength: f64) -> Self {
        Self { wavelength, ..self }
    }
    pub fn padding(self, osf: usize) -> Self {
        Self { osf, ..self }
    }
    pub fn pupil(self, pupil: Pupil) -> Self {
        Self {
            pupil: Some(pupil),
            ..self
        }
    }
}
impl Builder for ScienceCameraBuilder {
    type Component = ScienceCamera;
    fn build(self) -> Result<ScienceCamera> {
        let pupil = self.pupil.unwrap_or_else(|| Pupil::annulus(64, 3.2, 0f64));
        let n_px = pupil.n_px();
        let n_fft = n_px * self.osf.max(1);
        // diffraction limited peak of this pupil
        let flat: Vec<Complex64> = pupil
            .weights()
            .iter()
            .map(|&w| Complex64::new(w, 0f64))
            .collect();
        let dl_psf = fft::focal_plane_intensity(&flat, n_px, n_fft);
        let dl_peak = dl_psf.iter().cloned().fold(0f64, f64::max);
        log::info!(
            "ScienceCamera: {}px pupil imaged on {}px at {:.2}micron",
            n_px,
            n_fft,
            self.wavelength * 1e6
        );
        Ok(ScienceCamera {
            pupil,
            wavelength: self.wavelength,
            n_fft,
            dl_peak,
            image: vec![0f64; n_fft * n_fft],
            n_frames: 0,
            last_strehl: 0f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> ScienceCamera {
        ScienceCameraBuilder::default()
            .pupil(Pupil::annulus(32, 1.6, 0f64))
            .build()
            .unwrap()
    }

    #[test]
    fn flat_wavefront_is_diffraction_limited() {
        let mut cam = camera();
        let flat = PhaseMap::zeroed(32, 0.05);
        cam.accumulate(&flat);
        assert!((cam.instantaneous_strehl() - 1.0).abs() < 1e-9);
        assert!((cam.strehl() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn aberrations_lower_the_strehl() {
        let mut cam = camera();
        // 100nm rms of structured aberration at 1.65micron
        let values: Vec<f64> = (0..32 * 32)
            .map(|k| 141.0 * ((k % 13) as f64 * 0.5).sin())
            .collect();
        let phase = PhaseMap::from_values(values, 32, 0.05);
        cam.accumulate(&phase);
        let s = cam.instantaneous_strehl();
        assert!(s < 1.0);
        assert!(s > 0f64);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut cam = camera();
        let flat = PhaseMap::zeroed(32, 0.05);
        cam.accumulate(&flat);
        cam.accumulate(&flat);
        let a = cam.finalize();
        let b = cam.finalize();
        assert_eq!(a.image, b.image);
        assert_eq!(a.strehl, b.strehl);
        assert_eq!(a.n_frames, 2);
    }

    #[test]
    fn long_exposure_averages_strehl() {
        let mut cam = camera();
        let flat = PhaseMap::zeroed(32, 0.05);
        let values: Vec<f64> = (0..32 * 32)
            .map(|k| 200.0 * ((k % 7) as f64).cos())
            .collect();
        let blurred = PhaseMap::from_values(values, 32, 0.05);
        cam.accumulate(&flat);
        let s_flat = cam.instantaneous_strehl();
        cam.accumulate(&blurred);
        let s_blurred = cam.instantaneous_strehl();
        let long = cam.strehl();
        assert!(long < s_flat);
        assert!(long > s_blurred * 0.5);
    }
}
