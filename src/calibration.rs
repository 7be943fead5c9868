//!
//! # Interaction matrix calibration
//!
//! Pokes every actuator of every mirror with a push-pull pattern, records
//! the noise-free sensor response and inverts the stacked interaction
//! matrix with a truncated SVD pseudo-inverse.
//!
//! Columns are ordered mirror by mirror, rows sensor by sensor, so the
//! control matrix maps the concatenated slope vector back to the
//! concatenated command vector.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    dm::DeformableMirror,
    wavefrontsensor::{Slopes, WavefrontSensor},
    Result,
};

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("under-determined calibration: {n_slopes} responding slopes for {n_modes} modes")]
    UnderDetermined { n_slopes: usize, n_modes: usize },
    #[error("interaction matrix is excessively ill-conditioned, all {0} singular values truncated")]
    IllConditioned(usize),
    #[error("pseudo-inverse: {0}")]
    PseudoInverse(String),
    #[error(
        "cached calibration is {found_rows}x{found_cols}, the system needs {rows}x{cols}"
    )]
    CacheMismatch {
        rows: usize,
        cols: usize,
        found_rows: usize,
        found_cols: usize,
    },
}

/// Calibrated interaction and control matrices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    /// Slope response per unit command, `n_slopes x n_modes`
    pub interaction: DMatrix<f64>,
    /// Truncated pseudo-inverse of `interaction`, `n_modes x n_slopes`
    pub control: DMatrix<f64>,
    pub poke_amplitude: f64,
    pub sv_threshold: f64,
    /// Singular values discarded by the truncation
    pub n_truncated: usize,
}
impl Calibration {
    pub fn n_slopes(&self) -> usize {
        self.interaction.nrows()
    }
    pub fn n_modes(&self) -> usize {
        self.interaction.ncols()
    }
    /// Maps a slope vector to a command vector
    pub fn solve(&self, slopes: &[f64]) -> DVector<f64> {
        &self.control * DVector::from_column_slice(slopes)
    }
    pub fn to_pickle<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path.as_ref())?;
        serde_pickle::to_writer(&mut file, self, Default::default())?;
        Ok(())
    }
    pub fn from_pickle<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(serde_pickle::from_reader(file, Default::default())?)
    }
    /// Loads a cached calibration, rejecting it if its shape does not
    /// match the system
    pub fn from_pickle_checked<P: AsRef<Path>>(
        path: P,
        n_slopes: usize,
        n_modes: usize,
    ) -> Result<Self> {
        let this = Self::from_pickle(path)?;
        if this.n_slopes() != n_slopes || this.n_modes() != n_modes {
            return Err(CalibrationError::CacheMismatch {
                rows: n_slopes,
                cols: n_modes,
                found_rows: this.n_slopes(),
                found_cols: this.n_modes(),
            }
            .into());
        }
        Ok(this)
    }
}

/// [`Calibration`] builder
#[derive(Debug, Clone)]
pub struct Calibrator {
    /// Push-pull command amplitude \[nm\]
    pub poke_amplitude: f64,
    /// Relative singular value truncation threshold
    pub sv_threshold: f64,
    /// Cache file, reused when present and shape-consistent
    pub cache: Option<PathBuf>,
    pub progress: bool,
}
impl Default for Calibrator {
    fn default() -> Self {
        Self {
            poke_amplitude: 50.0,
            sv_threshold: 1e-6,
            cache: None,
            progress: true,
        }
    }
}
impl Calibrator {
    pub fn poke_amplitude(self, poke_amplitude: f64) -> Self {
        Self {
            poke_amplitude,
            ..self
        }
    }
    pub fn sv_threshold(self, sv_threshold: f64) -> Self {
        Self {
            sv_threshold,
            ..self
        }
    }
    pub fn cache<P: Into<PathBuf>>(self, path: P) -> Self {
        Self {
            cache: Some(path.into()),
            ..self
        }
    }
    pub fn quiet(self) -> Self {
        Self {
            progress: false,
            ..self
        }
    }

    /// Calibrates the mirrors against the sensors
    ///
    /// With `force` unset, a shape-consistent cached calibration is
    /// returned instead of poking the mirrors again.
    pub fn calibrate(
        &self,
        dms: &[&dyn DeformableMirror],
        wfss: &[&dyn WavefrontSensor],
        force: bool,
    ) -> Result<Calibration> {
        let n_modes: usize = dms.iter().map(|dm| dm.n_actuators()).sum();
        let n_slopes: usize = wfss.iter().map(|wfs| wfs.n_slopes()).sum();
        if let Some(cache) = self.cache.as_ref().filter(|_| !force) {
            if cache.is_file() {
                match Calibration::from_pickle_checked(cache, n_slopes, n_modes) {
                    Ok(calibration) => {
                        log::info!("calibration loaded from {:?}", cache);
                        return Ok(calibration);
                    }
                    Err(e) => log::warn!("discarding cached calibration: {}", e),
                }
            }
        }

        let pb = self.progress.then(|| {
            let pb = ProgressBar::new(n_modes as u64);
            pb.set_style(
                ProgressStyle::with_template(
                    "{msg} [{eta_precise}] {bar:50.cyan/blue} {pos:>7}/{len:7}",
                )
                .unwrap(),
            );
            pb.set_message("Calibrating");
            pb
        });

        // push-pull poke of every mode of every mirror; the static
        // measurement path is pure so the pokes run in parallel
        let poke = self.poke_amplitude;
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(n_modes);
        for dm in dms {
            let n = dm.n_actuators();
            let mut dm_columns: Vec<Vec<f64>> = (0..n)
                .into_par_iter()
                .map(|k| {
                    let mut command = vec![0f64; n];
                    command[k] = poke;
                    let push = dm.apply(&command)?.phase;
                    command[k] = -poke;
                    let pull = dm.apply(&command)?.phase;
                    let slopes: Vec<Slopes> = wfss
                        .iter()
                        .map(|wfs| {
                            let up = wfs.measure_static(&push);
                            let down = wfs.measure_static(&pull);
                            Slopes(
                                up.0.iter()
                                    .zip(&down.0)
                                    .map(|(u, d)| (u - d) / (2.0 * poke))
                                    .collect(),
                            )
                        })
                        .collect();
                    if let Some(pb) = &pb {
                        pb.inc(1);
                    }
                    Ok(Slopes::concat(slopes).0)
                })
                .collect::<Result<Vec<_>>>()?;
            columns.append(&mut dm_columns);
        }
        if let Some(pb) = pb {
            pb.finish();
        }

        let interaction = DMatrix::<f64>::from_iterator(
            n_slopes,
            n_modes,
            columns.iter().flat_map(|c| c.iter().cloned()),
        );

        // slopes that respond to no mode carry no information
        let n_active = (0..n_slopes)
            .filter(|&i| interaction.row(i).iter().any(|&v| v != 0f64))
            .count();
        if n_active < n_modes {
            return Err(CalibrationError::UnderDetermined {
                n_slopes: n_active,
                n_modes,
            }
            .into());
        }

        let svd = interaction.clone().svd(true, true);
        let sigma_max = svd.singular_values.max();
        let n_sv = svd.singular_values.len();
        let floor = self.sv_threshold * sigma_max;
        let n_truncated = svd.singular_values.iter().filter(|&&s| s <= floor).count();
        if n_truncated == n_sv {
            return Err(CalibrationError::IllConditioned(n_sv).into());
        }
        log::info!(
            "calibration singular values range: [{:e},{:e}], {} truncated",
            svd.singular_values.min(),
            sigma_max,
            n_truncated
        );
        let control = svd
            .pseudo_inverse(floor)
            .map_err(|msg| CalibrationError::PseudoInverse(msg.to_string()))?;

        let calibration = Calibration {
            interaction,
            control,
            poke_amplitude: poke,
            sv_threshold: self.sv_threshold,
            n_truncated,
        };
        if let Some(cache) = &self.cache {
            if let Some(dir) = cache.parent() {
                std::fs::create_dir_all(dir)?;
            }
            calibration.to_pickle(cache)?;
            log::info!("calibration saved to {:?}", cache);
        }
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dm::ZonalDmBuilder,
        wavefrontsensor::{Geometric, ShackHartmannBuilder},
        Builder,
    };

    fn system() -> (crate::dm::ZonalDm, crate::wavefrontsensor::ShackHartmann<Geometric>) {
        let dm = ZonalDmBuilder::default()
            .n_actuator_side(5)
            .sampling(32, 0.05)
            .build()
            .unwrap();
        // fully illuminated square pupil, every lenslet valid
        let pupil = crate::mask::Pupil::from_weights(vec![1f64; 32 * 32], 32, 1.6);
        let wfs = ShackHartmannBuilder::<Geometric>::default()
            .lenslet_array(4, 8, 0.4)
            .pupil(pupil)
            .build()
            .unwrap();
        (dm, wfs)
    }

    #[test]
    fn interaction_matrix_shape() {
        let (dm, wfs) = system();
        let calibration = Calibrator::default()
            .quiet()
            .calibrate(&[&dm], &[&wfs], true)
            .unwrap();
        assert_eq!(calibration.n_modes(), 25);
        assert_eq!(calibration.n_slopes(), 32);
    }

    #[test]
    fn control_is_a_pseudo_inverse() {
        let (dm, wfs) = system();
        let calibration = Calibrator::default()
            .quiet()
            .calibrate(&[&dm], &[&wfs], true)
            .unwrap();
        // D*C*D = D holds whatever the truncation; piston is in the
        // null space of a gradient sensor so C*D itself is a projector,
        // not the identity
        let d = &calibration.interaction;
        let dcd = d * &calibration.control * d;
        let err = (&dcd - d).norm() / d.norm();
        assert!(err < 1e-6, "D*C*D departs from D: {err}");
    }

    #[test]
    fn poke_amplitude_cancels_out() {
        let (dm, wfs) = system();
        let a = Calibrator::default()
            .quiet()
            .poke_amplitude(20.0)
            .calibrate(&[&dm], &[&wfs], true)
            .unwrap();
        let b = Calibrator::default()
            .quiet()
            .poke_amplitude(80.0)
            .calibrate(&[&dm], &[&wfs], true)
            .unwrap();
        // the response is linear so the poke amplitude divides out
        let err = (&a.interaction - &b.interaction).amax();
        assert!(err < 1e-9);
    }

    #[test]
    fn cache_roundtrip_and_shape_check() {
        let (dm, wfs) = system();
        let cache = std::env::temp_dir().join("aoloop-calibration-test.pkl");
        let calibration = Calibrator::default()
            .quiet()
            .cache(&cache)
            .calibrate(&[&dm], &[&wfs], true)
            .unwrap();
        let reloaded =
            Calibration::from_pickle_checked(&cache, calibration.n_slopes(), calibration.n_modes())
                .unwrap();
        assert_eq!(reloaded.interaction, calibration.interaction);
        assert!(Calibration::from_pickle_checked(&cache, 1, 1).is_err());
        let _ = std::fs::remove_file(cache);
    }
}
