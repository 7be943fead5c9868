use serde::{Deserialize, Serialize};
use std::ops::{AddAssign, SubAssign};

/// A square wavefront map
///
/// The wavefront is sampled on a regular `n x n` grid with a pixel scale of
/// `delta` meters and holds the optical path difference in nanometers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMap {
    values: Vec<f64>,
    n: usize,
    delta: f64,
}
impl PhaseMap {
    /// Creates a zeroed wavefront map
    pub fn zeroed(n: usize, delta: f64) -> Self {
        Self {
            values: vec![0f64; n * n],
            n,
            delta,
        }
    }
    /// Creates a wavefront map from raw samples
    ///
    /// # Panics
    /// If `values.len()` is not `n^2`
    pub fn from_values(values: Vec<f64>, n: usize, delta: f64) -> Self {
        assert_eq!(values.len(), n * n, "phase map is not {n}x{n}");
        Self { values, n, delta }
    }
    /// Grid side length in pixels
    pub fn n(&self) -> usize {
        self.n
    }
    /// Pixel scale in meters
    pub fn delta(&self) -> f64 {
        self.delta
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.values
    }
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j]
    }
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.values[i * self.n + j] = value;
    }
    /// Wavefront root-mean-square over the given mask, in nanometers
    ///
    /// Piston is removed before taking the RMS.
    pub fn rms(&self, weights: &[f64]) -> f64 {
        let (sw, swp) = self
            .values
            .iter()
            .zip(weights)
            .fold((0f64, 0f64), |(sw, swp), (p, w)| (sw + w, swp + w * p));
        if sw == 0f64 {
            return 0f64;
        }
        let mean = swp / sw;
        let var = self
            .values
            .iter()
            .zip(weights)
            .map(|(p, w)| w * (p - mean) * (p - mean))
            .sum::<f64>()
            / sw;
        var.sqrt()
    }
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|p| p.is_finite())
    }
}
impl AddAssign<&PhaseMap> for PhaseMap {
    fn add_assign(&mut self, rhs: &PhaseMap) {
        debug_assert_eq!(self.n, rhs.n);
        self.values
            .iter_mut()
            .zip(&rhs.values)
            .for_each(|(a, b)| *a += b);
    }
}
impl SubAssign<&PhaseMap> for PhaseMap {
    fn sub_assign(&mut self, rhs: &PhaseMap) {
        debug_assert_eq!(self.n, rhs.n);
        self.values
            .iter_mut()
            .zip(&rhs.values)
            .for_each(|(a, b)| *a -= b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_removes_piston() {
        let mut map = PhaseMap::zeroed(4, 1.0);
        map.as_mut_slice().iter_mut().for_each(|p| *p = 100.0);
        let weights = vec![1f64; 16];
        assert!(map.rms(&weights) < 1e-12);
    }

    #[test]
    fn rms_of_step() {
        let mut values = vec![-1f64; 8];
        values.extend(vec![1f64; 8]);
        let map = PhaseMap::from_values(values, 4, 1.0);
        let weights = vec![1f64; 16];
        assert!((map.rms(&weights) - 1.0).abs() < 1e-12);
    }
}
