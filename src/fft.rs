//! Two-dimensional FFT helpers on top of [`rustfft`]
//!
//! Used for the von Karman phase screen synthesis, the diffractive
//! Shack-Hartmann focal planes and the science camera point spread
//! function.

use rustfft::{num_complex::Complex64, FftPlanner};

/// In-place 2D FFT of a row-major `n x n` complex buffer
///
/// The transform is unnormalized, matching the `rustfft` convention.
pub fn fft2(buffer: &mut [Complex64], n: usize, inverse: bool) {
    debug_assert_eq!(buffer.len(), n * n);
    let mut planner = FftPlanner::new();
    let fft = if inverse {
        planner.plan_fft_inverse(n)
    } else {
        planner.plan_fft_forward(n)
    };
    // rows
    for row in buffer.chunks_exact_mut(n) {
        fft.process(row);
    }
    // columns, through a transpose
    transpose(buffer, n);
    for row in buffer.chunks_exact_mut(n) {
        fft.process(row);
    }
    transpose(buffer, n);
}

/// Swaps quadrants so the zero frequency sits at the center of the array
pub fn fftshift(buffer: &mut [Complex64], n: usize) {
    debug_assert_eq!(buffer.len(), n * n);
    let h = n / 2;
    for i in 0..h {
        for j in 0..n {
            let src = i * n + j;
            let dst = ((i + h) % n) * n + (j + h) % n;
            buffer.swap(src, dst);
        }
    }
}

fn transpose(buffer: &mut [Complex64], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            buffer.swap(i * n + j, j * n + i);
        }
    }
}

/// Magnitude squared of a pupil-plane field propagated to the focal plane
///
/// The field is zero padded into an `n_fft x n_fft` grid, transformed and
/// shifted so the point spread function is centered.
pub fn focal_plane_intensity(field: &[Complex64], n: usize, n_fft: usize) -> Vec<f64> {
    debug_assert!(n_fft >= n);
    let mut buffer = vec![Complex64::new(0.0, 0.0); n_fft * n_fft];
    for i in 0..n {
        buffer[i * n_fft..i * n_fft + n].copy_from_slice(&field[i * n..(i + 1) * n]);
    }
    fft2(&mut buffer, n_fft, false);
    fftshift(&mut buffer, n_fft);
    buffer.into_iter().map(|c| c.norm_sqr()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft2_roundtrip() {
        let n = 8;
        let mut buffer: Vec<Complex64> = (0..n * n)
            .map(|k| Complex64::new(k as f64, -(k as f64) * 0.5))
            .collect();
        let original = buffer.clone();
        fft2(&mut buffer, n, false);
        fft2(&mut buffer, n, true);
        let scale = (n * n) as f64;
        for (b, o) in buffer.iter().zip(&original) {
            assert!((b / scale - o).norm() < 1e-9);
        }
    }

    #[test]
    fn flat_field_focuses_on_axis() {
        let n = 16;
        let field = vec![Complex64::new(1.0, 0.0); n * n];
        let n_fft = 32;
        let intensity = focal_plane_intensity(&field, n, n_fft);
        let peak = intensity
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak, (n_fft / 2) * n_fft + n_fft / 2);
    }
}
