//!
//! # Simulation controller
//!
//! [`Simulation`] assembles the correction chain described by a [`Config`]
//! and drives it: [`Simulation::calibrate`] records the interaction matrix,
//! [`Simulation::step`] advances the loop by one sampling period and
//! [`Simulation::run_loop`] runs it to completion, persisting the run
//! products in a timestamped directory.
//!
//! The loop ordering per iteration is
//!  1. translate the phase screens by one wind step,
//!  2. sense the wavefront, residual in closed loop,
//!  3. reconstruct and update the mirror commands,
//!  4. accumulate the on-axis residual on the science camera.

use std::{
    fs::File,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    atmosphere::Atmosphere,
    calibration::{Calibration, Calibrator},
    config::{Config, DmConfig, SensorKind, WfsConfig},
    dm::{DeformableMirror, DmKind, ModalDm, ZonalDm},
    guidestar::GuideStar,
    mask::Pupil,
    phase::PhaseMap,
    reconstructor::{LoopMode, Reconstructor},
    science::{Exposure, ScienceCamera},
    wavefrontsensor::{
        Diffractive, Geometric, Pyramid, ShackHartmann, Slopes, WavefrontSensor,
    },
    Builder, FromBuilder, Result,
};

/// Per-iteration telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: usize,
    /// Elapsed loop time \[s\]
    pub time: f64,
    /// Uncorrected on-axis wavefront error \[nm RMS\]
    pub wfe_rms: f64,
    /// Corrected on-axis wavefront error \[nm RMS\]
    pub residual_rms: f64,
    /// Instantaneous science Strehl ratio
    pub strehl: f64,
    /// Actuators clipped at the stroke limit this iteration
    pub n_clipped: usize,
}

/// Everything a finished run leaves behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProducts {
    pub history: Vec<IterationResult>,
    /// DM commands \[nm\] sent at each iteration, mirrors concatenated
    pub command_history: Vec<Vec<f64>>,
    pub exposure: Exposure,
    /// Long exposure Strehl ratio
    pub strehl: f64,
    pub n_clipped_total: usize,
}

/// Closed/open loop adaptive optics simulation
pub struct Simulation {
    config: Config,
    pupil: Pupil,
    atmosphere: Atmosphere,
    wfss: Vec<Box<dyn WavefrontSensor>>,
    dms: Vec<Box<dyn DeformableMirror>>,
    science: ScienceCamera,
    calibration: Option<Calibration>,
    reconstructor: Option<Reconstructor>,
    /// Mirror surface at the current commands
    surface: PhaseMap,
    iteration: usize,
    n_clipped_total: usize,
    history: Vec<IterationResult>,
    command_history: Vec<Vec<f64>>,
    cancel: Arc<AtomicBool>,
    run_directory: Option<PathBuf>,
}

fn build_wfs(config: &WfsConfig, pupil: &Pupil, seed: u64) -> Result<Box<dyn WavefrontSensor>> {
    let guide_star = GuideStar::builder()
        .position(config.guide_star_position.0, config.guide_star_position.1)
        .wavelength(config.wavelength);
    let guide_star = match config.guide_star_height {
        Some(height) => guide_star.height(height),
        None => guide_star,
    };
    Ok(match config.kind {
        SensorKind::ShackHartmann => Box::new(
            ShackHartmann::<Geometric>::builder()
                .lenslet_array(
                    config.n_side_lenslet,
                    config.n_px_lenslet,
                    pupil.diameter() / config.n_side_lenslet as f64,
                )
                .threshold(config.threshold)
                .remove_tilt(config.remove_tilt)
                .guide_star(guide_star)
                .pupil(pupil.clone())
                .seed(seed)
                .build()?,
        ),
        SensorKind::DiffractiveShackHartmann => Box::new(
            ShackHartmann::<Diffractive>::builder()
                .lenslet_array(
                    config.n_side_lenslet,
                    config.n_px_lenslet,
                    pupil.diameter() / config.n_side_lenslet as f64,
                )
                .detector(config.n_px_framelet, config.osf, config.noise.clone())
                .threshold(config.threshold)
                .remove_tilt(config.remove_tilt)
                .lgs_elongation(
                    config.elongation_depth,
                    config.n_elongation_layer,
                    config.launch_position,
                )
                .guide_star(guide_star)
                .pupil(pupil.clone())
                .seed(seed)
                .build()?,
        ),
        SensorKind::Pyramid => {
            let mut builder = Pyramid::builder()
                .sensing_grid(config.n_side_lenslet, config.n_px_lenslet)
                .padding(config.osf)
                .threshold(config.threshold)
                .guide_star(guide_star)
                .pupil(pupil.clone())
                .seed(seed);
            if let Some(noise) = config.noise.clone() {
                builder = builder.noise(noise);
            }
            Box::new(builder.build()?)
        }
    })
}

fn build_dm(config: &DmConfig, pupil: &Pupil) -> Result<Box<dyn DeformableMirror>> {
    Ok(match config.kind {
        DmKind::Zonal => {
            let mut builder = ZonalDm::builder()
                .n_actuator_side(config.n_actuator_side)
                .sampling(pupil.n_px(), pupil.delta())
                .coupling(config.coupling);
            if let Some(stroke) = config.stroke {
                builder = builder.stroke(stroke);
            }
            Box::new(builder.build()?)
        }
        DmKind::Modal => {
            let mut builder = ModalDm::builder()
                .radial_order(config.radial_order)
                .sampling(pupil.n_px(), pupil.delta());
            if let Some(stroke) = config.stroke {
                builder = builder.stroke(stroke);
            }
            Box::new(builder.build()?)
        }
    })
}

impl Simulation {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let telescope = &config.telescope;
        let pupil = Pupil::annulus(telescope.n_px, telescope.diameter, telescope.obscuration);
        let delta = pupil.delta();
        // the screens must accommodate the pupil plus the wind translation
        let n_px_screen = if config.atmosphere.n_px_screen > 0 {
            config.atmosphere.n_px_screen
        } else {
            4 * telescope.n_px
        };
        let mut atm_builder = Atmosphere::builder()
            .r0_at_zenith(config.atmosphere.r0_at_zenith)
            .oscale(config.atmosphere.oscale)
            .zenith_angle(config.atmosphere.zenith_angle.to_radians())
            .screen(n_px_screen, delta)
            .seed(config.sim.seed);
        if config.atmosphere.has_custom_profile() {
            atm_builder = atm_builder.turbulence_profile(crate::atmosphere::TurbulenceProfile {
                n_layer: config.atmosphere.xi0.len(),
                altitude: config.atmosphere.altitude.clone(),
                xi0: config.atmosphere.xi0.clone(),
                wind_speed: config.atmosphere.wind_speed.clone(),
                wind_direction: config.atmosphere.wind_direction.clone(),
            });
        }
        let atmosphere = atm_builder.build()?;
        let wfss = config
            .wfs
            .iter()
            .enumerate()
            .map(|(k, wfs)| build_wfs(wfs, &pupil, config.sim.seed + k as u64))
            .collect::<Result<Vec<_>>>()?;
        let dms = config
            .dm
            .iter()
            .map(|dm| build_dm(dm, &pupil))
            .collect::<Result<Vec<_>>>()?;
        let science = ScienceCamera::builder()
            .wavelength(config.science.wavelength)
            .padding(config.science.osf)
            .pupil(pupil.clone())
            .build()?;
        let surface = PhaseMap::zeroed(telescope.n_px, delta);
        log::info!(
            "Simulation: {} sensor(s), {} mirror(s), r0={:.3}m",
            wfss.len(),
            dms.len(),
            atmosphere.r0()
        );
        Ok(Self {
            config,
            pupil,
            atmosphere,
            wfss,
            dms,
            science,
            calibration: None,
            reconstructor: None,
            surface,
            iteration: 0,
            n_clipped_total: 0,
            history: vec![],
            command_history: vec![],
            cancel: Arc::new(AtomicBool::new(false)),
            run_directory: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn atmosphere(&self) -> &Atmosphere {
        &self.atmosphere
    }
    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }
    pub fn iteration(&self) -> usize {
        self.iteration
    }
    /// Flag polled at every iteration boundary; raising it makes
    /// [`Simulation::run_loop`] stop after the current iteration
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Records the interaction matrix and sets up the reconstructor
    ///
    /// With `force` unset, a shape-consistent cached calibration is
    /// reused.
    pub fn calibrate(&mut self, force: bool) -> Result<&Calibration> {
        let dms: Vec<&dyn DeformableMirror> = self.dms.iter().map(|dm| dm.as_ref()).collect();
        let wfss: Vec<&dyn WavefrontSensor> = self.wfss.iter().map(|wfs| wfs.as_ref()).collect();
        let mut calibrator = Calibrator::default()
            .poke_amplitude(self.config.control.poke_amplitude)
            .sv_threshold(self.config.control.sv_threshold);
        if let Some(repository) = &self.config.sim.data_repository {
            calibrator = calibrator.cache(PathBuf::from(repository).join("calibration.pkl"));
        }
        let calibration = calibrator.calibrate(&dms, &wfss, force)?;
        self.reconstructor = Some(Reconstructor::new(
            calibration.clone(),
            self.config.control.gain,
            self.config.control.leak,
            self.config.control.mode,
        )?);
        self.calibration = Some(calibration);
        Ok(self.calibration.as_ref().unwrap())
    }

    /// Advances the loop by one sampling period
    pub fn step(&mut self) -> Result<IterationResult> {
        if self.reconstructor.is_none() {
            self.calibrate(false)?;
        }
        let n_px = self.pupil.n_px();
        let delta = self.pupil.delta();
        let dt = 1f64 / self.config.sim.sampling_frequency;
        let closed = self.config.control.mode == LoopMode::Closed;

        self.atmosphere.advance(dt);

        // sensing: each sensor sees the turbulence along its own line of
        // sight, minus the mirror correction in closed loop
        let slopes: Vec<Slopes> = self
            .wfss
            .par_iter_mut()
            .map(|wfs| {
                let mut phase = self.atmosphere.compose(wfs.guide_star(), n_px, delta)?;
                if closed {
                    phase -= &self.surface;
                }
                Ok(wfs.measure(&phase))
            })
            .collect::<Result<Vec<_>>>()?;
        let slopes = Slopes::concat(slopes);

        // reconstruction and mirror update
        let reconstructor = self.reconstructor.as_mut().unwrap();
        let command = reconstructor.reconstruct(&slopes)?.to_vec();
        let mut surface = PhaseMap::zeroed(n_px, delta);
        let mut n_clipped = 0;
        let mut offset = 0;
        for dm in &self.dms {
            let n = dm.n_actuators();
            let figure = dm.apply(&command[offset..offset + n])?;
            surface += &figure.phase;
            n_clipped += figure.n_clipped;
            offset += n;
        }
        self.surface = surface;
        self.n_clipped_total += n_clipped;

        // science path, on axis
        let on_axis = self
            .atmosphere
            .compose(&GuideStar::on_axis(), n_px, delta)?;
        let wfe_rms = on_axis.rms(self.pupil.weights());
        let mut residual = on_axis;
        residual -= &self.surface;
        let residual_rms = residual.rms(self.pupil.weights());
        if let Some(k) = residual.as_slice().iter().position(|p| !p.is_finite()) {
            return Err(crate::error::AoError::NumericAnomaly(k));
        }
        self.science.accumulate(&residual);

        self.iteration += 1;
        let result = IterationResult {
            iteration: self.iteration,
            time: self.iteration as f64 * dt,
            wfe_rms,
            residual_rms,
            strehl: self.science.instantaneous_strehl(),
            n_clipped,
        };
        self.history.push(result.clone());
        self.command_history.push(command);
        Ok(result)
    }

    /// Runs `n_iteration` loop iterations and persists the run products
    ///
    /// The loop stops early when the cancellation flag is raised; a
    /// numeric anomaly persists whatever was accumulated before the
    /// error is returned.
    pub fn run_loop(&mut self) -> Result<RunProducts> {
        let n_iteration = self.config.sim.n_iteration;
        for _ in 0..n_iteration {
            if self.cancel.load(Ordering::Relaxed) {
                log::warn!("run cancelled at iteration {}", self.iteration);
                break;
            }
            match self.step() {
                Ok(result) => {
                    if result.iteration % 100 == 0 {
                        log::info!(
                            "iteration {:4}: residual {:7.1}nm, Strehl {:.3}",
                            result.iteration,
                            result.residual_rms,
                            result.strehl
                        );
                    }
                }
                Err(e) => {
                    let products = self.products();
                    let _ = self.persist(&products);
                    return Err(e);
                }
            }
        }
        let products = self.products();
        self.persist(&products)?;
        Ok(products)
    }

    fn products(&self) -> RunProducts {
        RunProducts {
            history: self.history.clone(),
            command_history: self.command_history.clone(),
            exposure: self.science.finalize(),
            strehl: self.science.strehl(),
            n_clipped_total: self.n_clipped_total,
        }
    }

    fn persist(&mut self, products: &RunProducts) -> Result<()> {
        let Some(repository) = &self.config.sim.data_repository else {
            return Ok(());
        };
        let directory = match &self.run_directory {
            Some(directory) => directory.clone(),
            None => {
                let stamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let directory = PathBuf::from(repository).join(format!("run-{stamp}"));
                self.run_directory = Some(directory.clone());
                directory
            }
        };
        std::fs::create_dir_all(&directory)?;
        let mut file = File::create(directory.join("products.pkl"))?;
        serde_pickle::to_writer(&mut file, products, Default::default())?;
        self.config
            .to_toml(directory.join("config.toml"))
            .map_err(crate::error::AoError::from)?;
        log::info!("run products saved to {:?}", directory);
        Ok(())
    }

    /// Rewinds the turbulence, the mirrors and the science exposure
    pub fn reset(&mut self) {
        self.atmosphere.reset();
        if let Some(reconstructor) = &mut self.reconstructor {
            reconstructor.reset();
        }
        self.surface = PhaseMap::zeroed(self.pupil.n_px(), self.pupil.delta());
        self.science.reset();
        self.wfss.iter_mut().for_each(|wfs| wfs.reset());
        self.iteration = 0;
        self.n_clipped_total = 0;
        self.history.clear();
        self.command_history.clear();
        self.cancel.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.telescope.n_px = 64;
        config.telescope.diameter = 4.0;
        config.sim.n_iteration = 5;
        config.wfs[0].n_side_lenslet = 8;
        config.wfs[0].n_px_lenslet = 8;
        config.dm[0].n_actuator_side = 5;
        // single frozen layer keeps the test loop deterministic
        config.atmosphere.xi0 = vec![1.0];
        config.atmosphere.altitude = vec![0.0];
        config.atmosphere.wind_speed = vec![0.0];
        config.atmosphere.wind_direction = vec![0.0];
        config.atmosphere.n_px_screen = 128;
        config
    }

    #[test]
    fn simulation_assembles() {
        let sim = Simulation::new(small_config()).unwrap();
        assert_eq!(sim.iteration(), 0);
        assert!(sim.calibration().is_none());
    }

    #[test]
    fn step_reduces_the_residual() {
        let mut sim = Simulation::new(small_config()).unwrap();
        sim.calibrate(true).unwrap();
        let first = sim.step().unwrap();
        let mut last = first.clone();
        for _ in 0..4 {
            last = sim.step().unwrap();
        }
        // frozen turbulence, the integrator converges on it
        assert!(last.residual_rms < first.wfe_rms);
    }

    #[test]
    fn command_history_is_recorded() {
        let mut sim = Simulation::new(small_config()).unwrap();
        sim.calibrate(true).unwrap();
        let products = sim.run_loop().unwrap();
        assert_eq!(products.command_history.len(), products.history.len());
        let n_actuators = 5 * 5;
        assert!(products
            .command_history
            .iter()
            .all(|command| command.len() == n_actuators));
        assert!(products
            .command_history
            .last()
            .unwrap()
            .iter()
            .any(|&c| c != 0.0));
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let mut sim = Simulation::new(small_config()).unwrap();
        sim.calibrate(true).unwrap();
        sim.cancel_handle().store(true, Ordering::Relaxed);
        let products = sim.run_loop().unwrap();
        assert!(products.history.is_empty());
    }

    #[test]
    fn reset_rewinds_the_loop() {
        let mut sim = Simulation::new(small_config()).unwrap();
        sim.calibrate(true).unwrap();
        let a = sim.step().unwrap();
        sim.reset();
        let b = sim.step().unwrap();
        assert_eq!(a.wfe_rms, b.wfe_rms);
    }
}
