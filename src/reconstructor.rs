//!
//! # Wavefront reconstruction
//!
//! A leaky integrator driven by the calibrated control matrix:
//! in closed loop the command accumulates,
//! `c' = leak * c + gain * (C * s)`,
//! in open loop each measurement maps straight to a command,
//! `c' = gain * (C * s)`.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::{calibration::Calibration, wavefrontsensor::Slopes, Result};

#[derive(Debug, thiserror::Error)]
pub enum ReconstructorError {
    #[error("expected a {expected} element slope vector, got {got}")]
    SlopesLength { expected: usize, got: usize },
    #[error("loop gain must be in [0,1], got {0}")]
    Gain(f64),
    #[error("integrator leak must be in (0,1], got {0}")]
    Leak(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    Open,
    Closed,
}

/// Integrator reconstructor
pub struct Reconstructor {
    calibration: Calibration,
    gain: f64,
    leak: f64,
    mode: LoopMode,
    command: DVector<f64>,
}
impl Reconstructor {
    pub fn new(calibration: Calibration, gain: f64, leak: f64, mode: LoopMode) -> Result<Self> {
        if !(0f64..=1f64).contains(&gain) {
            return Err(ReconstructorError::Gain(gain).into());
        }
        if !(0f64 < leak && leak <= 1f64) {
            return Err(ReconstructorError::Leak(leak).into());
        }
        let n = calibration.n_modes();
        Ok(Self {
            calibration,
            gain,
            leak,
            mode,
            command: DVector::zeros(n),
        })
    }
    pub fn mode(&self) -> LoopMode {
        self.mode
    }
    pub fn gain(&self) -> f64 {
        self.gain
    }
    pub fn n_modes(&self) -> usize {
        self.calibration.n_modes()
    }
    /// Current integrated command \[nm\]
    pub fn command(&self) -> &[f64] {
        self.command.as_slice()
    }
    pub fn reset(&mut self) {
        self.command.fill(0f64);
    }
    /// Updates the command from a slope measurement
    ///
    /// Non-finite slopes or commands abort the update and leave the
    /// integrator state untouched.
    pub fn reconstruct(&mut self, slopes: &Slopes) -> Result<&[f64]> {
        if slopes.len() != self.calibration.n_slopes() {
            return Err(ReconstructorError::SlopesLength {
                expected: self.calibration.n_slopes(),
                got: slopes.len(),
            }
            .into());
        }
        if let Some(k) = slopes.0.iter().position(|s| !s.is_finite()) {
            return Err(crate::error::AoError::NumericAnomaly(k));
        }
        let update = self.calibration.solve(&slopes.0);
        let command = match self.mode {
            LoopMode::Closed => self.leak * &self.command + self.gain * update,
            LoopMode::Open => self.gain * update,
        };
        if let Some(k) = command.iter().position(|c| !c.is_finite()) {
            return Err(crate::error::AoError::NumericAnomaly(k));
        }
        self.command = command;
        Ok(self.command.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn identity_calibration(n: usize) -> Calibration {
        Calibration {
            interaction: DMatrix::identity(n, n),
            control: DMatrix::identity(n, n),
            poke_amplitude: 1.0,
            sv_threshold: 0.0,
            n_truncated: 0,
        }
    }

    #[test]
    fn zero_gain_never_moves() {
        let mut rec =
            Reconstructor::new(identity_calibration(4), 0.0, 1.0, LoopMode::Closed).unwrap();
        let command = rec.reconstruct(&Slopes(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        assert!(command.iter().all(|&c| c == 0f64));
    }

    #[test]
    fn open_loop_zero_gain_commands_nothing() {
        let mut rec =
            Reconstructor::new(identity_calibration(3), 0.0, 1.0, LoopMode::Open).unwrap();
        for slopes in [
            Slopes(vec![1.0, 2.0, 3.0]),
            Slopes(vec![-50.0, 0.0, 50.0]),
            Slopes(vec![1e6, -1e6, 1e6]),
        ] {
            let command = rec.reconstruct(&slopes).unwrap();
            assert!(command.iter().all(|&c| c == 0f64));
        }
        assert!(rec.command().iter().all(|&c| c == 0f64));
    }

    #[test]
    fn closed_loop_integrates() {
        let mut rec =
            Reconstructor::new(identity_calibration(2), 0.5, 1.0, LoopMode::Closed).unwrap();
        let slopes = Slopes(vec![1.0, -1.0]);
        rec.reconstruct(&slopes).unwrap();
        rec.reconstruct(&slopes).unwrap();
        assert_eq!(rec.command(), &[1.0, -1.0]);
    }

    #[test]
    fn open_loop_does_not_integrate() {
        let mut rec =
            Reconstructor::new(identity_calibration(2), 0.5, 1.0, LoopMode::Open).unwrap();
        let slopes = Slopes(vec![1.0, -1.0]);
        rec.reconstruct(&slopes).unwrap();
        rec.reconstruct(&slopes).unwrap();
        assert_eq!(rec.command(), &[0.5, -0.5]);
    }

    #[test]
    fn leak_bleeds_the_command() {
        let mut rec =
            Reconstructor::new(identity_calibration(1), 0.5, 0.99, LoopMode::Closed).unwrap();
        rec.reconstruct(&Slopes(vec![2.0])).unwrap();
        assert_eq!(rec.command(), &[1.0]);
        rec.reconstruct(&Slopes(vec![0.0])).unwrap();
        assert!((rec.command()[0] - 0.99).abs() < 1e-12);
    }

    #[test]
    fn non_finite_slopes_abort() {
        let mut rec =
            Reconstructor::new(identity_calibration(2), 0.5, 1.0, LoopMode::Closed).unwrap();
        rec.reconstruct(&Slopes(vec![1.0, 1.0])).unwrap();
        let before = rec.command().to_vec();
        match rec.reconstruct(&Slopes(vec![0.0, f64::NAN])) {
            Err(crate::error::AoError::NumericAnomaly(k)) => assert_eq!(k, 1),
            other => panic!("expected a numeric anomaly, got {other:?}"),
        }
        assert_eq!(rec.command(), before.as_slice());
    }

    #[test]
    fn slope_length_is_checked() {
        let mut rec =
            Reconstructor::new(identity_calibration(2), 0.5, 1.0, LoopMode::Closed).unwrap();
        assert!(rec.reconstruct(&Slopes(vec![1.0])).is_err());
    }

    #[test]
    fn invalid_gain_rejected() {
        assert!(Reconstructor::new(identity_calibration(1), 1.5, 1.0, LoopMode::Closed).is_err());
        assert!(Reconstructor::new(identity_calibration(1), 0.5, 0.0, LoopMode::Closed).is_err());
    }
}
