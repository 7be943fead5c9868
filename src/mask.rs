use serde::{Deserialize, Serialize};

/// A telescope pupil mask
///
/// The pupil is sampled on a regular `n_px x n_px` grid of weights in
/// `[0, 1]`; full pixels of an annular aperture weigh 1 and fully obscured
/// pixels weigh 0. The mask is shared read-only by every component that
/// needs the telescope footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pupil {
    weights: Vec<f64>,
    n_px: usize,
    diameter: f64,
}
impl Pupil {
    /// Creates an annular pupil from the telescope diameter and the central
    /// obscuration diameter, both in meters
    pub fn annulus(n_px: usize, diameter: f64, obscuration: f64) -> Self {
        let c = 0.5 * (n_px as f64 - 1.0);
        let delta = diameter / n_px as f64;
        let outer = 0.5 * diameter;
        let inner = 0.5 * obscuration;
        let weights = (0..n_px * n_px)
            .map(|k| {
                let x = ((k / n_px) as f64 - c) * delta;
                let y = ((k % n_px) as f64 - c) * delta;
                let r = x.hypot(y);
                if r <= outer && r >= inner {
                    1f64
                } else {
                    0f64
                }
            })
            .collect();
        Self {
            weights,
            n_px,
            diameter,
        }
    }
    /// Creates a pupil from caller supplied weights
    ///
    /// # Panics
    /// If `weights.len()` is not `n_px^2`
    pub fn from_weights(weights: Vec<f64>, n_px: usize, diameter: f64) -> Self {
        assert_eq!(weights.len(), n_px * n_px, "pupil mask is not {n_px}x{n_px}");
        Self {
            weights,
            n_px,
            diameter,
        }
    }
    /// Returns the total number of mask elements
    pub fn nel(&self) -> usize {
        self.weights.len()
    }
    /// Returns the number of non-zeros in the mask
    pub fn nnz(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0f64).count()
    }
    pub fn n_px(&self) -> usize {
        self.n_px
    }
    pub fn diameter(&self) -> f64 {
        self.diameter
    }
    /// Pixel scale in meters
    pub fn delta(&self) -> f64 {
        self.diameter / self.n_px as f64
    }
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
    /// Returns an iterator over the mask values
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.weights.iter().map(|&w| w > 0f64)
    }
    /// Returns the mask as a boolean vector
    pub fn to_vec(&self) -> Vec<bool> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annulus_fill() {
        let pupil = Pupil::annulus(64, 8.0, 0.0);
        let fill = pupil.nnz() as f64 / pupil.nel() as f64;
        // pi/4 to within pixelation
        assert!((fill - std::f64::consts::FRAC_PI_4).abs() < 0.05);
    }

    #[test]
    fn obscuration_removes_center() {
        let pupil = Pupil::annulus(64, 8.0, 2.0);
        let c = 32;
        assert_eq!(pupil.weights()[c * 64 + c], 0f64);
    }

    #[test]
    fn weights_mask_agree() {
        let pupil = Pupil::from_weights(vec![1., 0., 0., 1.], 2, 1.0);
        assert_eq!(pupil.to_vec(), vec![true, false, false, true]);
        assert_eq!(pupil.nnz(), 2);
    }
}
