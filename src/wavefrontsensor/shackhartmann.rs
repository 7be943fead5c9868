//!
//! # Shack-Hartmann wavefront sensor
//!
//! `ShackHartmann<M: Model>` is instantiated and initialized with the
//! `ShackHartmannBuilder<M: Model>` builder where `Model` is either type
//! [`Geometric`] or [`Diffractive`].
//!
//! The geometric model averages the local phase gradient over each
//! subaperture; the diffractive model propagates each subaperture to its
//! focal plane, applies the detector noise model and centroids the spots.

use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::{NoiseDataSheet, Slopes, WavefrontSensor, WavefrontSensorError};
use crate::{
    fft,
    guidestar::{GuideStar, GuideStarBuilder},
    mask::Pupil,
    phase::PhaseMap,
    Builder, FromBuilder, Result,
};

/// Lenslet array specifications
#[derive(Debug, Clone, PartialEq, Copy, Serialize, Deserialize)]
pub struct LensletArray {
    pub n_side_lenslet: usize,
    pub n_px_lenslet: usize,
    /// Lenslet pitch \[m\]
    pub d: f64,
}
impl Default for LensletArray {
    fn default() -> Self {
        LensletArray {
            n_side_lenslet: 1,
            n_px_lenslet: 511,
            d: 25.5,
        }
    }
}

/// Subaperture partition of the pupil, shared by both sensing models
#[derive(Debug, Clone)]
pub struct LensletGeometry {
    pub n_side_lenslet: usize,
    pub n_px_lenslet: usize,
    pub d: f64,
    /// Pupil weights over the full `n_px x n_px` grid
    pub weights: Vec<f64>,
    /// Subapertures above the illumination threshold
    pub valid: Vec<bool>,
    /// Illumination fraction per subaperture
    pub fill: Vec<f64>,
    pub wavelength: f64,
    /// Detector pixels per subaperture (diffractive model)
    pub n_px_framelet: usize,
    /// Focal plane oversampling factor (diffractive model)
    pub osf: usize,
    /// Centroiding threshold as a fraction of the spot peak
    pub cog_threshold: f64,
    /// Per sodium layer slice, the full pupil path difference \[nm\] from
    /// refocusing the sensor on that slice instead of the beacon; empty
    /// for a point source
    pub elongation: Vec<Vec<f64>>,
}
impl LensletGeometry {
    pub fn n_px(&self) -> usize {
        self.n_side_lenslet * self.n_px_lenslet
    }
    pub fn n_lenslet(&self) -> usize {
        self.n_side_lenslet * self.n_side_lenslet
    }
    pub fn n_valid_lenslet(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }
    /// Pupil pixel scale \[m\]
    pub fn delta(&self) -> f64 {
        self.d / self.n_px_lenslet as f64
    }
    pub fn n_fft(&self) -> usize {
        self.n_px_lenslet * self.osf
    }
}

/// Shack-Hartmann model type: [`Geometric`] or [`Diffractive`]
pub trait Model: Default + Clone + Send + Sync {
    fn reset(&mut self, geometry: &LensletGeometry);
    fn propagate(&mut self, geometry: &LensletGeometry, phase: &PhaseMap);
    fn readout(
        &mut self,
        geometry: &LensletGeometry,
        rng: &mut StdRng,
        noise: Option<&NoiseDataSheet>,
    );
    /// Raw slopes over the full lenslet grid, invalid subapertures zeroed
    fn process(&self, geometry: &LensletGeometry) -> Vec<f64>;
    /// Stateless noise-free measurement
    fn static_slopes(geometry: &LensletGeometry, phase: &PhaseMap) -> Vec<f64>;
    fn frame(&self) -> Option<&[f64]>;
}

/// Geometric (ray) sensing: averaged local phase gradients
#[derive(Debug, Default, Clone)]
pub struct Geometric {
    sx: Vec<f64>,
    sy: Vec<f64>,
    n_frames: usize,
}

// Pupil-weighted mean finite-difference gradient per subaperture [nm/m]
fn gradients(geometry: &LensletGeometry, phase: &PhaseMap) -> (Vec<f64>, Vec<f64>) {
    let nx = geometry.n_side_lenslet;
    let p = geometry.n_px_lenslet;
    let n_px = geometry.n_px();
    let delta = geometry.delta();
    let w = &geometry.weights;
    let mut sx = vec![0f64; nx * nx];
    let mut sy = vec![0f64; nx * nx];
    for a in 0..nx {
        for b in 0..nx {
            let (mut num_x, mut den_x) = (0f64, 0f64);
            let (mut num_y, mut den_y) = (0f64, 0f64);
            for i in a * p..(a + 1) * p {
                for j in b * p..(b + 1) * p {
                    if i + 1 < (a + 1) * p {
                        let ww = w[i * n_px + j] * w[(i + 1) * n_px + j];
                        num_x += ww * (phase.get(i + 1, j) - phase.get(i, j));
                        den_x += ww;
                    }
                    if j + 1 < (b + 1) * p {
                        let ww = w[i * n_px + j] * w[i * n_px + j + 1];
                        num_y += ww * (phase.get(i, j + 1) - phase.get(i, j));
                        den_y += ww;
                    }
                }
            }
            let k = a * nx + b;
            if den_x > 0f64 {
                sx[k] = num_x / (den_x * delta);
            }
            if den_y > 0f64 {
                sy[k] = num_y / (den_y * delta);
            }
        }
    }
    (sx, sy)
}

impl Model for Geometric {
    fn reset(&mut self, geometry: &LensletGeometry) {
        self.sx = vec![0f64; geometry.n_lenslet()];
        self.sy = vec![0f64; geometry.n_lenslet()];
        self.n_frames = 0;
    }
    fn propagate(&mut self, geometry: &LensletGeometry, phase: &PhaseMap) {
        if self.sx.len() != geometry.n_lenslet() {
            self.reset(geometry);
        }
        let (sx, sy) = gradients(geometry, phase);
        self.sx.iter_mut().zip(sx).for_each(|(a, b)| *a += b);
        self.sy.iter_mut().zip(sy).for_each(|(a, b)| *a += b);
        self.n_frames += 1;
    }
    fn readout(
        &mut self,
        _geometry: &LensletGeometry,
        rng: &mut StdRng,
        noise: Option<&NoiseDataSheet>,
    ) {
        // slope-equivalent Gaussian noise, the geometric analog of a
        // detector noise model
        if let Some(noise) = noise.filter(|n| n.rms_read_out_noise > 0f64) {
            let normal = Normal::new(0f64, noise.rms_read_out_noise).unwrap();
            self.sx.iter_mut().for_each(|s| *s += normal.sample(rng));
            self.sy.iter_mut().for_each(|s| *s += normal.sample(rng));
        }
    }
    fn process(&self, geometry: &LensletGeometry) -> Vec<f64> {
        let gain = if self.n_frames > 0 {
            1f64 / self.n_frames as f64
        } else {
            0f64
        };
        let masked = |s: &[f64]| {
            s.iter()
                .zip(&geometry.valid)
                .map(|(s, &v)| if v { s * gain } else { 0f64 })
                .collect::<Vec<f64>>()
        };
        let mut slopes = masked(&self.sx);
        slopes.extend(masked(&self.sy));
        slopes
    }
    fn static_slopes(geometry: &LensletGeometry, phase: &PhaseMap) -> Vec<f64> {
        let (sx, sy) = gradients(geometry, phase);
        let masked = |s: Vec<f64>| {
            s.into_iter()
                .zip(&geometry.valid)
                .map(|(s, &v)| if v { s } else { 0f64 })
                .collect::<Vec<f64>>()
        };
        let mut slopes = masked(sx);
        slopes.extend(masked(sy));
        slopes
    }
    fn frame(&self) -> Option<&[f64]> {
        None
    }
}

/// Diffractive (physical optics) sensing: subaperture focal planes
#[derive(Debug, Default, Clone)]
pub struct Diffractive {
    // accumulated focal plane intensities, one n_fft^2 imagelet per valid
    // subaperture
    fp: Vec<f64>,
    // binned detector framelets after readout
    detector: Vec<f64>,
    n_frames: usize,
}

// One subaperture pupil field
fn subap_field(
    geometry: &LensletGeometry,
    phase: &PhaseMap,
    a: usize,
    b: usize,
) -> Vec<Complex64> {
    let p = geometry.n_px_lenslet;
    let n_px = geometry.n_px();
    let phs2rad = 2.0 * std::f64::consts::PI * 1e-9 / geometry.wavelength;
    let mut field = Vec::with_capacity(p * p);
    for i in a * p..(a + 1) * p {
        for j in b * p..(b + 1) * p {
            let w = geometry.weights[i * n_px + j];
            let phi = phase.get(i, j) * phs2rad;
            field.push(Complex64::new(w * phi.cos(), w * phi.sin()));
        }
    }
    field
}

// Bin an n_fft^2 imagelet down to the n_px_framelet^2 detector framelet
fn bin_imagelet(geometry: &LensletGeometry, imagelet: &[f64]) -> Vec<f64> {
    let n_fft = geometry.n_fft();
    let n_det = geometry.n_px_framelet;
    let m = n_fft / n_det;
    let mut framelet = vec![0f64; n_det * n_det];
    for i in 0..n_fft {
        for j in 0..n_fft {
            framelet[(i / m) * n_det + j / m] += imagelet[i * n_fft + j];
        }
    }
    framelet
}

// Thresholded center of gravity relative to the framelet center [px]
fn centroid(geometry: &LensletGeometry, framelet: &[f64]) -> (f64, f64) {
    let n_det = geometry.n_px_framelet;
    let peak = framelet.iter().cloned().fold(0f64, f64::max);
    let floor = geometry.cog_threshold * peak;
    let (mut flux, mut cx, mut cy) = (0f64, 0f64, 0f64);
    for i in 0..n_det {
        for j in 0..n_det {
            let v = (framelet[i * n_det + j] - floor).max(0f64);
            flux += v;
            cx += v * i as f64;
            cy += v * j as f64;
        }
    }
    if flux > 0f64 {
        let c = 0.5 * (n_det as f64 - 1.0);
        (cx / flux - c, cy / flux - c)
    } else {
        (0f64, 0f64)
    }
}

impl Diffractive {
    // Accumulate the focal planes of all valid subapertures
    fn image(&mut self, geometry: &LensletGeometry, phase: &PhaseMap, weight: f64) {
        let p = geometry.n_px_lenslet;
        let n_fft = geometry.n_fft();
        let nx = geometry.n_side_lenslet;
        let mut k = 0;
        for a in 0..nx {
            for b in 0..nx {
                if !geometry.valid[a * nx + b] {
                    continue;
                }
                let field = subap_field(geometry, phase, a, b);
                let intensity = fft::focal_plane_intensity(&field, p, n_fft);
                self.fp[k * n_fft * n_fft..(k + 1) * n_fft * n_fft]
                    .iter_mut()
                    .zip(&intensity)
                    .for_each(|(a, b)| *a += weight * b);
                k += 1;
            }
        }
    }
    fn centroids(&self, geometry: &LensletGeometry) -> Vec<f64> {
        let nx = geometry.n_side_lenslet;
        let n_det = geometry.n_px_framelet;
        let mut sx = vec![0f64; nx * nx];
        let mut sy = vec![0f64; nx * nx];
        let mut k = 0;
        for (l, &valid) in geometry.valid.iter().enumerate() {
            if !valid {
                continue;
            }
            let framelet = &self.detector[k * n_det * n_det..(k + 1) * n_det * n_det];
            let (cx, cy) = centroid(geometry, framelet);
            sx[l] = cx;
            sy[l] = cy;
            k += 1;
        }
        sx.extend(sy);
        sx
    }
}
impl Model for Diffractive {
    fn reset(&mut self, geometry: &LensletGeometry) {
        let n_fft = geometry.n_fft();
        self.fp = vec![0f64; geometry.n_valid_lenslet() * n_fft * n_fft];
        self.detector.clear();
        self.n_frames = 0;
    }
    fn propagate(&mut self, geometry: &LensletGeometry, phase: &PhaseMap) {
        let n_fft = geometry.n_fft();
        if self.fp.len() != geometry.n_valid_lenslet() * n_fft * n_fft {
            self.reset(geometry);
        }
        if geometry.elongation.is_empty() {
            self.image(geometry, phase, 1f64);
        } else {
            // an elongated beacon is the incoherent sum of the sodium
            // layer slices, each seen through its own refocusing term
            let weight = 1f64 / geometry.elongation.len() as f64;
            for addition in &geometry.elongation {
                let mut slice = phase.clone();
                slice
                    .as_mut_slice()
                    .iter_mut()
                    .zip(addition)
                    .for_each(|(p, a)| *p += a);
                self.image(geometry, &slice, weight);
            }
        }
        self.n_frames += 1;
    }
    fn readout(
        &mut self,
        geometry: &LensletGeometry,
        rng: &mut StdRng,
        noise: Option<&NoiseDataSheet>,
    ) {
        let n_fft = geometry.n_fft();
        let n_det = geometry.n_px_framelet;
        let mut detector = Vec::with_capacity(geometry.n_valid_lenslet() * n_det * n_det);
        let fills: Vec<f64> = geometry
            .valid
            .iter()
            .zip(&geometry.fill)
            .filter(|(&v, _)| v)
            .map(|(_, &f)| f)
            .collect();
        for (k, fill) in fills.into_iter().enumerate() {
            let imagelet = &self.fp[k * n_fft * n_fft..(k + 1) * n_fft * n_fft];
            let mut framelet = bin_imagelet(geometry, imagelet);
            if let Some(noise) = noise {
                let total: f64 = framelet.iter().sum();
                let n_photon = noise.n_photon * noise.exposure_time * fill;
                let background = noise.n_background_photon * noise.exposure_time
                    / (n_det * n_det) as f64;
                let gain = if total > 0f64 { n_photon / total } else { 0f64 };
                for px in framelet.iter_mut() {
                    let mean = *px * gain + background;
                    *px = if mean > 0f64 {
                        Poisson::new(mean).unwrap().sample(rng)
                    } else {
                        0f64
                    };
                    if noise.rms_read_out_noise > 0f64 {
                        *px += Normal::new(0f64, noise.rms_read_out_noise)
                            .unwrap()
                            .sample(rng);
                    }
                }
            }
            detector.extend(framelet);
        }
        self.detector = detector;
    }
    fn process(&self, geometry: &LensletGeometry) -> Vec<f64> {
        if self.detector.is_empty() {
            return vec![0f64; 2 * geometry.n_lenslet()];
        }
        self.centroids(geometry)
    }
    fn static_slopes(geometry: &LensletGeometry, phase: &PhaseMap) -> Vec<f64> {
        let mut model = Diffractive::default();
        model.reset(geometry);
        model.propagate(geometry, phase);
        // no noise model on a static measurement
        let mut rng = StdRng::seed_from_u64(0);
        model.readout(geometry, &mut rng, None);
        model.process(geometry)
    }
    fn frame(&self) -> Option<&[f64]> {
        (!self.detector.is_empty()).then_some(self.detector.as_slice())
    }
}

/// Shack-Hartmann wavefront sensor
pub struct ShackHartmann<M: Model> {
    model: M,
    geometry: LensletGeometry,
    guide_star: GuideStar,
    /// Slopes measured on a flat wavefront, subtracted from every
    /// measurement
    reference_slopes: Vec<f64>,
    remove_tilt: bool,
    noise: Option<NoiseDataSheet>,
    rng: StdRng,
}
impl<M: Model> ShackHartmann<M> {
    pub fn n_valid_lenslet(&self) -> usize {
        self.geometry.n_valid_lenslet()
    }
    pub fn valid_lenslets(&self) -> &[bool] {
        &self.geometry.valid
    }
    pub fn geometry(&self) -> &LensletGeometry {
        &self.geometry
    }
    fn finish(&self, mut slopes: Vec<f64>) -> Slopes {
        slopes
            .iter_mut()
            .zip(&self.reference_slopes)
            .for_each(|(s, r)| *s -= r);
        let n = self.geometry.n_lenslet();
        for (k, &valid) in self.geometry.valid.iter().enumerate() {
            if !valid {
                slopes[k] = 0f64;
                slopes[k + n] = 0f64;
            }
        }
        if self.remove_tilt {
            let n_valid = self.geometry.n_valid_lenslet() as f64;
            for half in 0..2 {
                let mean: f64 = slopes[half * n..(half + 1) * n]
                    .iter()
                    .zip(&self.geometry.valid)
                    .filter(|(_, &v)| v)
                    .map(|(s, _)| s)
                    .sum::<f64>()
                    / n_valid;
                slopes[half * n..(half + 1) * n]
                    .iter_mut()
                    .zip(&self.geometry.valid)
                    .filter(|(_, &v)| v)
                    .for_each(|(s, _)| *s -= mean);
            }
        }
        Slopes(slopes)
    }
}
impl<M: Model> WavefrontSensor for ShackHartmann<M> {
    fn guide_star(&self) -> &GuideStar {
        &self.guide_star
    }
    fn n_slopes(&self) -> usize {
        2 * self.geometry.n_lenslet()
    }
    fn pupil_sampling(&self) -> usize {
        self.geometry.n_px()
    }
    fn reset(&mut self) {
        self.model.reset(&self.geometry);
    }
    fn propagate(&mut self, phase: &PhaseMap) {
        self.model.propagate(&self.geometry, phase);
    }
    fn readout(&mut self) {
        self.model
            .readout(&self.geometry, &mut self.rng, self.noise.as_ref());
    }
    fn process(&self) -> Slopes {
        self.finish(self.model.process(&self.geometry))
    }
    fn measure_static(&self, phase: &PhaseMap) -> Slopes {
        let mut slopes = M::static_slopes(&self.geometry, phase);
        slopes
            .iter_mut()
            .zip(&self.reference_slopes)
            .for_each(|(s, r)| *s -= r);
        let n = self.geometry.n_lenslet();
        for (k, &valid) in self.geometry.valid.iter().enumerate() {
            if !valid {
                slopes[k] = 0f64;
                slopes[k + n] = 0f64;
            }
        }
        Slopes(slopes)
    }
    fn frame(&self) -> Option<&[f64]> {
        self.model.frame()
    }
}
impl<M: Model> FromBuilder for ShackHartmann<M> {
    type ComponentBuilder = ShackHartmannBuilder<M>;
}

/// [`ShackHartmann`] builder
///
/// Default properties:
///  - lenslet_array:
///    - n_side_lenslet: 1
///    - n_px_lenslet: 511px
///    - lenslet pitch: 25.5m
///  - detector: 8px framelets, 2x oversampling, no noise
///  - illumination threshold: 0.5
///  - guide star: on-axis natural guide star
#[derive(Debug, Clone)]
pub struct ShackHartmannBuilder<M: Model> {
    pub lenslet_array: LensletArray,
    pub n_px_framelet: usize,
    pub osf: usize,
    pub threshold: f64,
    pub cog_threshold: f64,
    pub noise: Option<NoiseDataSheet>,
    pub guide_star: GuideStarBuilder,
    pub remove_tilt: bool,
    /// Sodium layer thickness \[m\], 0 for a point source
    pub elongation_depth: f64,
    /// Focus planes sampling the sodium layer
    pub n_elongation_layer: usize,
    /// Laser launch position in the pupil \[m\]
    pub launch_position: (f64, f64),
    pub seed: u64,
    pupil: Option<Pupil>,
    marker: std::marker::PhantomData<M>,
}
impl<M: Model> Default for ShackHartmannBuilder<M> {
    fn default() -> Self {
        Self {
            lenslet_array: LensletArray::default(),
            n_px_framelet: 8,
            osf: 2,
            threshold: 0.5,
            cog_threshold: 0f64,
            noise: None,
            guide_star: GuideStarBuilder::default(),
            remove_tilt: false,
            elongation_depth: 0f64,
            n_elongation_layer: 5,
            launch_position: (0f64, 0f64),
            seed: 2020,
            pupil: None,
            marker: std::marker::PhantomData,
        }
    }
}
impl<M: Model> ShackHartmannBuilder<M> {
    pub fn lenslet_array(self, n_side_lenslet: usize, n_px_lenslet: usize, d: f64) -> Self {
        Self {
            lenslet_array: LensletArray {
                n_side_lenslet,
                n_px_lenslet,
                d,
            },
            ..self
        }
    }
    pub fn detector(
        self,
        n_px_framelet: usize,
        osf: usize,
        noise: Option<NoiseDataSheet>,
    ) -> Self {
        Self {
            n_px_framelet,
            osf,
            noise,
            ..self
        }
    }
    /// Set the minimum illumination fraction of a valid subaperture
    pub fn threshold(self, threshold: f64) -> Self {
        Self { threshold, ..self }
    }
    /// Set the centroiding threshold as a fraction of the spot peak
    pub fn cog_threshold(self, cog_threshold: f64) -> Self {
        Self {
            cog_threshold,
            ..self
        }
    }
    pub fn guide_star(self, guide_star: GuideStarBuilder) -> Self {
        Self { guide_star, ..self }
    }
    pub fn remove_tilt(self, remove_tilt: bool) -> Self {
        Self {
            remove_tilt,
            ..self
        }
    }
    /// Set the sodium layer thickness \[m\], the number of focus planes
    /// sampling it and the laser launch position in the pupil \[m\]
    ///
    /// Spot elongation applies to the diffractive model of a finite
    /// height guide star only; the geometric model keeps sensing the
    /// beacon centroid.
    pub fn lgs_elongation(
        self,
        elongation_depth: f64,
        n_elongation_layer: usize,
        launch_position: (f64, f64),
    ) -> Self {
        Self {
            elongation_depth,
            n_elongation_layer,
            launch_position,
            ..self
        }
    }
    /// Share the telescope pupil with the sensor; without it an unobscured
    /// round pupil matching the lenslet array is assumed
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
impl<M: Model> Builder for ShackHartmannBuilder<M> {
    type Component = ShackHartmann<M>;
    fn build(self) -> Result<ShackHartmann<M>> {
        let LensletArray {
            n_side_lenslet,
            n_px_lenslet,
            d,
        } = self.lenslet_array;
        let n_px = n_side_lenslet * n_px_lenslet;
        let pupil = self
            .pupil
            .unwrap_or_else(|| Pupil::annulus(n_px, d * n_side_lenslet as f64, 0f64));
        if pupil.n_px() != n_px {
            return Err(WavefrontSensorError::LensletSampling {
                n_px: pupil.n_px(),
                n_side_lenslet,
            }
            .into());
        }
        let n_fft = n_px_lenslet * self.osf;
        if n_fft % self.n_px_framelet != 0 {
            return Err(WavefrontSensorError::Binning {
                n_fft,
                n_px_framelet: self.n_px_framelet,
            }
            .into());
        }
        // subaperture illumination
        let mut fill = vec![0f64; n_side_lenslet * n_side_lenslet];
        for a in 0..n_side_lenslet {
            for b in 0..n_side_lenslet {
                let mut sum = 0f64;
                for i in a * n_px_lenslet..(a + 1) * n_px_lenslet {
                    for j in b * n_px_lenslet..(b + 1) * n_px_lenslet {
                        sum += pupil.weights()[i * n_px + j];
                    }
                }
                fill[a * n_side_lenslet + b] = sum / (n_px_lenslet * n_px_lenslet) as f64;
            }
        }
        let valid: Vec<bool> = fill.iter().map(|&f| f >= self.threshold).collect();
        if !valid.iter().any(|&v| v) {
            return Err(WavefrontSensorError::NoValidLenslet(self.threshold).into());
        }
        let guide_star = self.guide_star.build()?;
        // per sodium layer slice, the quadratic path difference between a
        // beacon refocused on the slice altitude and the nominal beacon,
        // centered on the laser launch position; an off-axis launch turns
        // the focus term into the radial tilt that elongates the spots
        let elongation = match guide_star.height {
            Some(h0) if self.elongation_depth > 0f64 => {
                let n_layer = self.n_elongation_layer.max(2);
                let delta = d / n_px_lenslet as f64;
                let half = 0.5 * (n_px as f64 - 1.0);
                let (xl, yl) = self.launch_position;
                (0..n_layer)
                    .map(|l| {
                        let h = h0 - 0.5 * self.elongation_depth
                            + self.elongation_depth * l as f64 / (n_layer - 1) as f64;
                        let curvature = 1f64 / h - 1f64 / h0;
                        (0..n_px * n_px)
                            .map(|k| {
                                let x = ((k / n_px) as f64 - half) * delta - xl;
                                let y = ((k % n_px) as f64 - half) * delta - yl;
                                0.5 * curvature * (x * x + y * y) * 1e9
                            })
                            .collect()
                    })
                    .collect()
            }
            _ => {
                if self.elongation_depth > 0f64 {
                    log::warn!("spot elongation needs a finite guide star altitude, ignored");
                }
                vec![]
            }
        };
        let geometry = LensletGeometry {
            n_side_lenslet,
            n_px_lenslet,
            d,
            weights: pupil.weights().to_vec(),
            valid,
            fill,
            wavelength: guide_star.wavelength,
            n_px_framelet: self.n_px_framelet,
            osf: self.osf,
            cog_threshold: self.cog_threshold,
            elongation,
        };
        log::info!(
            "ShackHartmann {0}x{0}: {1} valid lenslets",
            n_side_lenslet,
            geometry.n_valid_lenslet()
        );
        let flat = PhaseMap::zeroed(n_px, geometry.delta());
        let reference_slopes = M::static_slopes(&geometry, &flat);
        Ok(ShackHartmann {
            model: M::default(),
            geometry,
            guide_star,
            reference_slopes,
            remove_tilt: self.remove_tilt,
            noise: self.noise,
            rng: StdRng::seed_from_u64(self.seed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometric_8x8() -> ShackHartmann<Geometric> {
        ShackHartmannBuilder::<Geometric>::default()
            .lenslet_array(8, 8, 1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn flat_wavefront_zero_slopes() {
        let mut wfs = geometric_8x8();
        let flat = PhaseMap::zeroed(64, wfs.geometry().delta());
        let slopes = wfs.measure(&flat);
        assert_eq!(slopes.len(), 2 * 64);
        assert!(slopes.rms() < 1e-12);
    }

    #[test]
    fn tilt_gives_uniform_x_slopes() {
        let mut wfs = geometric_8x8();
        let delta = wfs.geometry().delta();
        let gradient = 250f64; // nm/m
        let values: Vec<f64> = (0..64 * 64)
            .map(|k| (k / 64) as f64 * delta * gradient)
            .collect();
        let phase = PhaseMap::from_values(values, 64, delta);
        let slopes = wfs.measure(&phase);
        let n = 64;
        for (k, &valid) in wfs.valid_lenslets().iter().enumerate() {
            if valid {
                assert!((slopes.0[k] - gradient).abs() < 1e-9);
                assert!(slopes.0[k + n].abs() < 1e-9);
            } else {
                assert_eq!(slopes.0[k], 0f64);
            }
        }
    }

    #[test]
    fn vignetted_lenslets_are_zero_filled() {
        // heavily obscured pupil, corner subapertures dark
        let pupil = Pupil::annulus(64, 8.0, 3.0);
        let wfs = ShackHartmannBuilder::<Geometric>::default()
            .lenslet_array(8, 8, 1.0)
            .pupil(pupil)
            .build()
            .unwrap();
        assert!(wfs.n_valid_lenslet() < 64);
        assert_eq!(wfs.n_slopes(), 128);
    }

    #[test]
    fn diffractive_senses_tilt_sign() {
        let mut wfs = ShackHartmannBuilder::<Diffractive>::default()
            .lenslet_array(4, 16, 1.0)
            .detector(8, 2, None)
            .build()
            .unwrap();
        let delta = wfs.geometry().delta();
        // half a wave of tilt across the pupil at 500nm
        let values: Vec<f64> = (0..64 * 64)
            .map(|k| (k / 64) as f64 * 250.0 / 64.0)
            .collect();
        let phase = PhaseMap::from_values(values, 64, delta);
        let slopes = wfs.measure(&phase);
        let valid_x: Vec<f64> = slopes.0[..16]
            .iter()
            .zip(wfs.valid_lenslets())
            .filter(|(_, &v)| v)
            .map(|(&s, _)| s)
            .collect();
        assert!(!valid_x.is_empty());
        // all spots move the same way
        assert!(valid_x.iter().all(|&s| s > 0f64) || valid_x.iter().all(|&s| s < 0f64));
    }

    // per-framelet second moment along x, summed over the detector
    fn spot_spread(wfs: &ShackHartmann<Diffractive>) -> f64 {
        let frame = wfs.frame().unwrap();
        let n_det = wfs.geometry().n_px_framelet;
        let mut spread = 0f64;
        for framelet in frame.chunks(n_det * n_det) {
            let (mut flux, mut cx, mut cxx) = (0f64, 0f64, 0f64);
            for i in 0..n_det {
                for j in 0..n_det {
                    let v = framelet[i * n_det + j];
                    flux += v;
                    cx += v * i as f64;
                    cxx += v * (i * i) as f64;
                }
            }
            if flux > 0f64 {
                spread += cxx / flux - (cx / flux) * (cx / flux);
            }
        }
        spread
    }

    #[test]
    fn sodium_layer_elongates_the_spots() {
        let lgs = GuideStarBuilder::default()
            .height(90e3)
            .wavelength(589e-9);
        let build = |depth: f64| {
            ShackHartmannBuilder::<Diffractive>::default()
                .lenslet_array(4, 16, 1.0)
                .detector(8, 2, None)
                .guide_star(lgs.clone())
                .lgs_elongation(depth, 3, (2.0, 0.0))
                .build()
                .unwrap()
        };
        let flat = PhaseMap::zeroed(64, 1.0 / 16.0);
        let mut point = build(0f64);
        let slopes = point.measure(&flat);
        assert!(slopes.rms() < 1e-12);
        let mut elongated = build(5e3);
        // the reference slopes absorb the per subaperture spot offsets
        let slopes = elongated.measure(&flat);
        assert!(slopes.rms() < 1e-9);
        // the spots smear radially away from the launch point
        assert!(spot_spread(&elongated) > 1.01 * spot_spread(&point));
    }

    #[test]
    fn static_measure_is_reproducible() {
        let wfs = geometric_8x8();
        let delta = wfs.geometry().delta();
        let values: Vec<f64> = (0..64 * 64).map(|k| ((k % 7) as f64).sin()).collect();
        let phase = PhaseMap::from_values(values, 64, delta);
        assert_eq!(wfs.measure_static(&phase), wfs.measure_static(&phase));
    }

    #[test]
    fn multi_exposure_accumulates() {
        let mut wfs = geometric_8x8();
        let delta = wfs.geometry().delta();
        let values: Vec<f64> = (0..64 * 64)
            .map(|k| (k / 64) as f64 * delta * 100.0)
            .collect();
        let phase = PhaseMap::from_values(values, 64, delta);
        // two identical sub-exposures average to a single one
        wfs.reset();
        wfs.propagate(&phase);
        wfs.propagate(&phase);
        wfs.readout();
        let double = wfs.process();
        let single = wfs.measure(&phase);
        for (a, b) in double.0.iter().zip(&single.0) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
