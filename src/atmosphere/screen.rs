use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::fft;

/// Wavelength at which the Fried parameter is defined, in meters
pub const R0_WAVELENGTH: f64 = 500e-9;

/// A single turbulence phase screen
///
/// The screen is a square array of optical path difference in nanometers
/// with toroidal boundary conditions: translating it by a full period
/// returns it to its original alignment, so the screen is inexhaustible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseScreen {
    values: Vec<f64>,
    n: usize,
    /// Pixel scale \[m\]
    delta: f64,
    /// Fried parameter the screen statistics were drawn for \[m\]
    r0: f64,
    /// Outer scale, `None` for Kolmogorov statistics \[m\]
    l0: Option<f64>,
}
impl PhaseScreen {
    /// Synthesizes a new screen with von Karman statistics
    ///
    /// The screen is drawn in the spatial frequency domain from the von
    /// Karman spectrum `0.023 r0^(-5/3) (f^2 + 1/L0^2)^(-11/6)` with
    /// Gaussian random complex amplitudes and transformed back to the
    /// spatial domain. The same seed always yields the same screen.
    pub fn von_karman(n: usize, delta: f64, r0: f64, l0: Option<f64>, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let df = 1.0 / (n as f64 * delta);
        let f0 = l0.map_or(0f64, |l0| 1.0 / l0);
        let c2 = 0.0229 * r0.powf(-5.0 / 3.0);
        let mut spectrum = vec![Complex64::new(0.0, 0.0); n * n];
        for i in 0..n {
            // FFT frequency ordering
            let ki = if i <= n / 2 { i as f64 } else { i as f64 - n as f64 };
            for j in 0..n {
                let kj = if j <= n / 2 { j as f64 } else { j as f64 - n as f64 };
                if i == 0 && j == 0 {
                    continue;
                }
                let f2 = (ki * df).powi(2) + (kj * df).powi(2);
                let psd = c2 * (f2 + f0 * f0).powf(-11.0 / 6.0);
                let amplitude = (psd).sqrt() * df;
                let (g1, g2): (f64, f64) =
                    (rng.sample(StandardNormal), rng.sample(StandardNormal));
                spectrum[i * n + j] = Complex64::new(g1 * amplitude, g2 * amplitude);
            }
        }
        fft::fft2(&mut spectrum, n, true);
        // Discarding the imaginary part halves the variance, the sqrt(2)
        // restores it; the result is in radians at R0_WAVELENGTH.
        let rad2nm = R0_WAVELENGTH * 1e9 / (2.0 * std::f64::consts::PI);
        let values = spectrum
            .into_iter()
            .map(|c| c.re * std::f64::consts::SQRT_2 * rad2nm)
            .collect();
        Self {
            values,
            n,
            delta,
            r0,
            l0,
        }
    }
    /// Wraps an existing phase array, trusted as-is
    pub fn from_values(values: Vec<f64>, n: usize, delta: f64, r0: f64, l0: Option<f64>) -> Self {
        assert_eq!(values.len(), n * n, "phase screen is not {n}x{n}");
        Self {
            values,
            n,
            delta,
            r0,
            l0,
        }
    }
    pub fn n(&self) -> usize {
        self.n
    }
    pub fn delta(&self) -> f64 {
        self.delta
    }
    pub fn r0(&self) -> f64 {
        self.r0
    }
    pub fn l0(&self) -> Option<f64> {
        self.l0
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
    /// Rescales the screen strength from the Fried parameter it was drawn
    /// for to `r0`
    ///
    /// Turbulent phase scales as `r0^(-5/6)`.
    pub fn rescale_to_r0(&mut self, r0: f64) {
        let gain = (self.r0 / r0).powf(5.0 / 6.0);
        self.values.iter_mut().for_each(|p| *p *= gain);
        self.r0 = r0;
    }
    /// Translates the screen in place by whole pixels with wrap-around
    /// boundaries
    ///
    /// This is the only mutation path of a screen after creation.
    pub fn rotate(&mut self, di: isize, dj: isize) {
        let n = self.n as isize;
        let di = di.rem_euclid(n) as usize;
        let dj = dj.rem_euclid(n) as usize;
        if dj != 0 {
            for row in self.values.chunks_exact_mut(self.n) {
                row.rotate_left(dj);
            }
        }
        if di != 0 {
            self.values.rotate_left(di * self.n);
        }
    }
    /// Bilinear interpolation at fractional pixel coordinates with
    /// wrap-around boundaries
    #[inline]
    pub fn bilinear(&self, x: f64, y: f64) -> f64 {
        let n = self.n as isize;
        let x0 = x.floor();
        let y0 = y.floor();
        let tx = x - x0;
        let ty = y - y0;
        let i0 = (x0 as isize).rem_euclid(n) as usize;
        let j0 = (y0 as isize).rem_euclid(n) as usize;
        let i1 = (x0 as isize + 1).rem_euclid(n) as usize;
        let j1 = (y0 as isize + 1).rem_euclid(n) as usize;
        let v00 = self.values[i0 * self.n + j0];
        let v01 = self.values[i0 * self.n + j1];
        let v10 = self.values[i1 * self.n + j0];
        let v11 = self.values[i1 * self.n + j1];
        v00 * (1.0 - tx) * (1.0 - ty)
            + v01 * (1.0 - tx) * ty
            + v10 * tx * (1.0 - ty)
            + v11 * tx * ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesis_is_reproducible() {
        let a = PhaseScreen::von_karman(32, 0.1, 0.15, Some(30.0), 42);
        let b = PhaseScreen::von_karman(32, 0.1, 0.15, Some(30.0), 42);
        assert_eq!(a, b);
    }

    #[test]
    fn stronger_turbulence_larger_rms() {
        let weak = PhaseScreen::von_karman(64, 0.1, 0.30, Some(30.0), 7);
        let strong = PhaseScreen::von_karman(64, 0.1, 0.10, Some(30.0), 7);
        let rms = |s: &PhaseScreen| {
            (s.as_slice().iter().map(|p| p * p).sum::<f64>() / s.as_slice().len() as f64).sqrt()
        };
        assert!(rms(&strong) > rms(&weak));
    }

    #[test]
    fn full_rotation_restores_alignment() {
        let mut screen = PhaseScreen::von_karman(16, 0.1, 0.15, None, 11);
        let original = screen.clone();
        for _ in 0..16 {
            screen.rotate(0, 1);
        }
        assert_eq!(screen, original);
    }

    #[test]
    fn rescale_scales_amplitude() {
        let mut screen = PhaseScreen::von_karman(16, 0.1, 0.2, Some(30.0), 3);
        let before = screen.as_slice()[17];
        screen.rescale_to_r0(0.1);
        let gain = (0.2f64 / 0.1).powf(5.0 / 6.0);
        assert!((screen.as_slice()[17] - before * gain).abs() < 1e-12);
        assert_eq!(screen.r0(), 0.1);
    }

    #[test]
    fn bilinear_at_grid_points() {
        let screen = PhaseScreen::von_karman(16, 0.1, 0.15, None, 5);
        assert!((screen.bilinear(3.0, 4.0) - screen.as_slice()[3 * 16 + 4]).abs() < 1e-12);
    }
}
