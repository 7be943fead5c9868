//! # Pyramid wavefront sensor
//!
//! A non-modulated 4-sided pyramid: the pupil field is propagated to the
//! focal plane, split into 4 quadrants at the pyramid apex, and each
//! quadrant is propagated back to a pupil image. Signals are the
//! normalized quadrant differences binned to the sensing grid.

use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use rustfft::num_complex::Complex64;

use super::{NoiseDataSheet, Slopes, WavefrontSensor, WavefrontSensorError};
use crate::{
    fft,
    guidestar::{GuideStar, GuideStarBuilder},
    mask::Pupil,
    phase::PhaseMap,
    Builder, FromBuilder, Result,
};

#[derive(Debug, Clone)]
struct PyramidGeometry {
    /// Sensing cells across the pupil
    nx: usize,
    /// Pupil samples per sensing cell
    n_px_cell: usize,
    /// Focal plane padding factor
    osf: usize,
    weights: Vec<f64>,
    valid: Vec<bool>,
    wavelength: f64,
}
impl PyramidGeometry {
    fn n_px(&self) -> usize {
        self.nx * self.n_px_cell
    }
    fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }
}

// The 4 pupil images seen through the pyramid faces, each n_px x n_px
fn pupil_images(geometry: &PyramidGeometry, phase: &PhaseMap) -> [Vec<f64>; 4] {
    let n_px = geometry.n_px();
    let n_fft = n_px * geometry.osf;
    let phs2rad = 2.0 * std::f64::consts::PI * 1e-9 / geometry.wavelength;
    let mut field = vec![Complex64::new(0f64, 0f64); n_fft * n_fft];
    for i in 0..n_px {
        for j in 0..n_px {
            let w = geometry.weights[i * n_px + j];
            let phi = phase.get(i, j) * phs2rad;
            field[i * n_fft + j] = Complex64::new(w * phi.cos(), w * phi.sin());
        }
    }
    fft::fft2(&mut field, n_fft, false);
    fft::fftshift(&mut field, n_fft);
    let h = n_fft / 2;
    // each pyramid face selects one focal plane quadrant and re-images
    // the pupil
    let mut images: [Vec<f64>; 4] = Default::default();
    for (q, image) in images.iter_mut().enumerate() {
        let (i0, j0) = (h * (q / 2), h * (q % 2));
        let mut quadrant = vec![Complex64::new(0f64, 0f64); n_fft * n_fft];
        for i in 0..h {
            for j in 0..h {
                quadrant[i * n_fft + j] = field[(i0 + i) * n_fft + j0 + j];
            }
        }
        fft::fft2(&mut quadrant, n_fft, true);
        *image = (0..n_px * n_px)
            .map(|k| quadrant[(k / n_px) * n_fft + k % n_px].norm_sqr())
            .collect();
    }
    images
}

// Bin a pupil image down to the nx x nx sensing grid
fn bin_to_cells(geometry: &PyramidGeometry, image: &[f64]) -> Vec<f64> {
    let nx = geometry.nx;
    let p = geometry.n_px_cell;
    let n_px = geometry.n_px();
    let mut cells = vec![0f64; nx * nx];
    for i in 0..n_px {
        for j in 0..n_px {
            cells[(i / p) * nx + j / p] += image[i * n_px + j];
        }
    }
    cells
}

fn quadrant_slopes(geometry: &PyramidGeometry, quadrants: &[Vec<f64>; 4]) -> Vec<f64> {
    let nx = geometry.nx;
    let [q00, q01, q10, q11] = quadrants;
    let mut sx = vec![0f64; nx * nx];
    let mut sy = vec![0f64; nx * nx];
    for k in 0..nx * nx {
        if !geometry.valid[k] {
            continue;
        }
        let total = q00[k] + q01[k] + q10[k] + q11[k];
        if total > 0f64 {
            sx[k] = (q00[k] + q01[k] - q10[k] - q11[k]) / total;
            sy[k] = (q00[k] + q10[k] - q01[k] - q11[k]) / total;
        }
    }
    sx.extend(sy);
    sx
}

/// Pyramid wavefront sensor
pub struct Pyramid {
    geometry: PyramidGeometry,
    guide_star: GuideStar,
    reference_slopes: Vec<f64>,
    noise: Option<NoiseDataSheet>,
    rng: StdRng,
    // accumulated binned quadrant images
    quadrants: [Vec<f64>; 4],
    detector: Option<[Vec<f64>; 4]>,
}
impl Pyramid {
    pub fn n_valid_cell(&self) -> usize {
        self.geometry.n_valid()
    }
    pub fn valid_cells(&self) -> &[bool] {
        &self.geometry.valid
    }
    fn raw_static(geometry: &PyramidGeometry, phase: &PhaseMap) -> Vec<f64> {
        let images = pupil_images(geometry, phase);
        let quadrants = [
            bin_to_cells(geometry, &images[0]),
            bin_to_cells(geometry, &images[1]),
            bin_to_cells(geometry, &images[2]),
            bin_to_cells(geometry, &images[3]),
        ];
        quadrant_slopes(geometry, &quadrants)
    }
    fn finish(&self, mut slopes: Vec<f64>) -> Slopes {
        slopes
            .iter_mut()
            .zip(&self.reference_slopes)
            .for_each(|(s, r)| *s -= r);
        let n = self.geometry.nx * self.geometry.nx;
        for (k, &valid) in self.geometry.valid.iter().enumerate() {
            if !valid {
                slopes[k] = 0f64;
                slopes[k + n] = 0f64;
            }
        }
        Slopes(slopes)
    }
}
impl WavefrontSensor for Pyramid {
    fn guide_star(&self) -> &GuideStar {
        &self.guide_star
    }
    fn n_slopes(&self) -> usize {
        2 * self.geometry.nx * self.geometry.nx
    }
    fn pupil_sampling(&self) -> usize {
        self.geometry.n_px()
    }
    fn reset(&mut self) {
        let n = self.geometry.nx * self.geometry.nx;
        self.quadrants = [vec![0f64; n], vec![0f64; n], vec![0f64; n], vec![0f64; n]];
        self.detector = None;
    }
    fn propagate(&mut self, phase: &PhaseMap) {
        let n = self.geometry.nx * self.geometry.nx;
        if self.quadrants[0].len() != n {
            self.reset();
        }
        let images = pupil_images(&self.geometry, phase);
        for (acc, image) in self.quadrants.iter_mut().zip(&images) {
            acc.iter_mut()
                .zip(bin_to_cells(&self.geometry, image))
                .for_each(|(a, b)| *a += b);
        }
    }
    fn readout(&mut self) {
        let mut detector = self.quadrants.clone();
        if let Some(noise) = &self.noise {
            let total: f64 = detector.iter().flat_map(|q| q.iter()).sum();
            let n_photon = noise.n_photon * noise.exposure_time;
            let gain = if total > 0f64 { n_photon / total } else { 0f64 };
            for cell in detector.iter_mut().flat_map(|q| q.iter_mut()) {
                let mean = *cell * gain;
                *cell = if mean > 0f64 {
                    Poisson::new(mean).unwrap().sample(&mut self.rng)
                } else {
                    0f64
                };
            }
        }
        self.detector = Some(detector);
    }
    fn process(&self) -> Slopes {
        match &self.detector {
            Some(detector) => self.finish(quadrant_slopes(&self.geometry, detector)),
            None => Slopes(vec![0f64; self.n_slopes()]),
        }
    }
    fn measure_static(&self, phase: &PhaseMap) -> Slopes {
        self.finish(Self::raw_static(&self.geometry, phase))
    }
    fn frame(&self) -> Option<&[f64]> {
        None
    }
}
impl FromBuilder for Pyramid {
    type ComponentBuilder = PyramidBuilder;
}

/// [`Pyramid`] builder
///
/// Default properties:
///  - 32x32 sensing cells, 4 pupil samples each
///  - 2x focal plane padding
///  - illumination threshold: 0.5
///  - on-axis natural guide star
#[derive(Debug, Clone)]
pub struct PyramidBuilder {
    pub nx: usize,
    pub n_px_cell: usize,
    pub osf: usize,
    pub threshold: f64,
    pub noise: Option<NoiseDataSheet>,
    pub guide_star: GuideStarBuilder,
    pub seed: u64,
    pupil: Option<Pupil>,
}
impl Default for PyramidBuilder {
    fn default() -> Self {
        Self {
            nx: 32,
            n_px_cell: 4,
            osf: 2,
            threshold: 0.5,
            noise: None,
            guide_star: GuideStarBuilder::default(),
            seed: 2020,
            pupil: None,
        }
    }
}
impl PyramidBuilder {
    pub fn sensing_grid(self, nx: usize, n_px_cell: usize) -> Self {
        Self {
            nx,
            n_px_cell,
            ..self
        }
    }
    pub fn padding(self, osf: usize) -> Self {
        Self { osf, ..self }
    }
    pub fn threshold(self, threshold: f64) -> Self {
        Self { threshold, ..self }
    }
    pub fn noise(self, noise: NoiseDataSheet) -> Self {
        Self {
            noise: Some(noise),
            ..self
        }
    }
    pub fn guide_star(self, guide_star: GuideStarBuilder) -> Self {
        Self { guide_star, ..self }
    }
    pub fn pupil(self, pupil: Pupil) -> Self {
        Self {
            pupil: Some(pupil),
            ..self
        }
    }
    pub fn seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
}
impl Builder for PyramidBuilder {
    type Component = Pyramid;
    fn build(self) -> Result<Pyramid> {
        let n_px = self.nx * self.n_px_cell;
        let pupil = self
            .pupil
            .unwrap_or_else(|| Pupil::annulus(n_px, n_px as f64 * 0.05, 0f64));
        if pupil.n_px() != n_px {
            return Err(WavefrontSensorError::LensletSampling {
                n_px: pupil.n_px(),
                n_side_lenslet: self.nx,
            }
            .into());
        }
        let mut fill = vec![0f64; self.nx * self.nx];
        for i in 0..n_px {
            for j in 0..n_px {
                fill[(i / self.n_px_cell) * self.nx + j / self.n_px_cell] +=
                    pupil.weights()[i * n_px + j];
            }
        }
        let cell_area = (self.n_px_cell * self.n_px_cell) as f64;
        let valid: Vec<bool> = fill.iter().map(|&f| f / cell_area >= self.threshold).collect();
        if !valid.iter().any(|&v| v) {
            return Err(WavefrontSensorError::NoValidLenslet(self.threshold).into());
        }
        let guide_star = self.guide_star.build()?;
        let geometry = PyramidGeometry {
            nx: self.nx,
            n_px_cell: self.n_px_cell,
            osf: self.osf,
            weights: pupil.weights().to_vec(),
            valid,
            wavelength: guide_star.wavelength,
        };
        log::info!(
            "Pyramid {0}x{0}: {1} valid cells",
            self.nx,
            geometry.n_valid()
        );
        let flat = PhaseMap::zeroed(n_px, pupil.delta());
        let reference_slopes = Pyramid::raw_static(&geometry, &flat);
        let n = self.nx * self.nx;
        Ok(Pyramid {
            geometry,
            guide_star,
            reference_slopes,
            noise: self.noise,
            rng: StdRng::seed_from_u64(self.seed),
            quadrants: [vec![0f64; n], vec![0f64; n], vec![0f64; n], vec![0f64; n]],
            detector: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pyramid_16() -> Pyramid {
        PyramidBuilder::default()
            .sensing_grid(16, 4)
            .pupil(Pupil::annulus(64, 1.0, 0f64))
            .build()
            .unwrap()
    }

    #[test]
    fn flat_wavefront_zero_signal() {
        let mut pym = pyramid_16();
        let flat = PhaseMap::zeroed(64, 1.0 / 64.0);
        let slopes = pym.measure(&flat);
        assert_eq!(slopes.len(), 2 * 16 * 16);
        assert!(slopes.rms() < 1e-12);
    }

    #[test]
    fn tilt_gives_signal() {
        let mut pym = pyramid_16();
        let delta = 1.0 / 64.0;
        // quarter wave of tilt at 500nm
        let values: Vec<f64> = (0..64 * 64)
            .map(|k| (k / 64) as f64 * 125.0 / 64.0)
            .collect();
        let phase = PhaseMap::from_values(values, 64, delta);
        let slopes = pym.measure(&phase);
        assert!(slopes.rms() > 1e-6);
    }

    #[test]
    fn invalid_cells_are_zero_filled() {
        let pym = pyramid_16();
        let delta = 1.0 / 64.0;
        let values: Vec<f64> = (0..64 * 64).map(|k| ((k % 11) as f64).cos() * 50.0).collect();
        let phase = PhaseMap::from_values(values, 64, delta);
        let slopes = pym.measure_static(&phase);
        let n = 16 * 16;
        for (k, &valid) in pym.valid_cells().iter().enumerate() {
            if !valid {
                assert_eq!(slopes.0[k], 0f64);
                assert_eq!(slopes.0[k + n], 0f64);
            }
        }
    }

    #[test]
    fn signals_are_flux_normalized() {
        let mut pym = pyramid_16();
        let delta = 1.0 / 64.0;
        let values: Vec<f64> = (0..64 * 64)
            .map(|k| (k / 64) as f64 * 125.0 / 64.0)
            .collect();
        let phase = PhaseMap::from_values(values, 64, delta);
        let slopes = pym.measure(&phase);
        assert!(slopes.0.iter().all(|s| s.abs() <= 1.0 + 1e-9));
    }
}
