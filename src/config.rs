//!
//! # Simulation configuration
//!
//! The whole simulation is described by a single TOML document:
//!
//! ```toml
//! [sim]
//! sampling_frequency = 500.0
//! n_iteration = 500
//!
//! [telescope]
//! diameter = 8.0
//! obscuration = 1.2
//! n_px = 128
//!
//! [atmosphere]
//! r0_at_zenith = 0.16
//! oscale = 25.0
//!
//! [[wfs]]
//! kind = "shackhartmann"
//! n_side_lenslet = 8
//!
//! [[dm]]
//! kind = "zonal"
//! n_actuator_side = 9
//!
//! [science]
//! wavelength = 1.65e-6
//!
//! [control]
//! mode = "closed"
//! gain = 0.5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{dm::DmKind, reconstructor::LoopMode, wavefrontsensor::NoiseDataSheet};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration file")]
    Read(#[from] std::io::Error),
    #[error("cannot parse configuration file")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(msg.into()))
}

/// Loop timing and duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Loop rate \[Hz\]
    pub sampling_frequency: f64,
    pub n_iteration: usize,
    /// Run products directory, one timestamped subdirectory per run
    pub data_repository: Option<String>,
    pub seed: u64,
}
impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sampling_frequency: 500.0,
            n_iteration: 500,
            data_repository: None,
            seed: 2020,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeConfig {
    /// Aperture diameter \[m\]
    pub diameter: f64,
    /// Central obscuration diameter \[m\]
    pub obscuration: f64,
    /// Pupil sampling \[px\]
    pub n_px: usize,
}
impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            diameter: 8.0,
            obscuration: 0f64,
            n_px: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtmosphereConfig {
    /// Fried parameter at zenith at 500nm \[m\]
    pub r0_at_zenith: f64,
    /// Outer scale \[m\]
    pub oscale: f64,
    /// Zenith angle \[deg\]
    pub zenith_angle: f64,
    /// Phase screen side \[px\], 0 to derive from the telescope sampling
    pub n_px_screen: usize,
    /// Per-layer fractional Cn^2 profile, empty for the default profile
    pub xi0: Vec<f64>,
    pub altitude: Vec<f64>,
    pub wind_speed: Vec<f64>,
    pub wind_direction: Vec<f64>,
}
impl Default for AtmosphereConfig {
    fn default() -> Self {
        Self {
            r0_at_zenith: 0.16,
            oscale: 25.0,
            zenith_angle: 30.0,
            n_px_screen: 0,
            xi0: vec![],
            altitude: vec![],
            wind_speed: vec![],
            wind_direction: vec![],
        }
    }
}
impl AtmosphereConfig {
    pub fn has_custom_profile(&self) -> bool {
        !self.xi0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    ShackHartmann,
    DiffractiveShackHartmann,
    Pyramid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WfsConfig {
    pub kind: SensorKind,
    pub n_side_lenslet: usize,
    pub n_px_lenslet: usize,
    /// Detector pixels per subaperture (diffractive Shack-Hartmann)
    pub n_px_framelet: usize,
    pub osf: usize,
    /// Valid subaperture illumination threshold
    pub threshold: f64,
    /// Guide star offset from the optical axis \[arcsec\]
    pub guide_star_position: (f64, f64),
    /// Laser guide star altitude \[m\], unset for a natural star
    pub guide_star_height: Option<f64>,
    pub wavelength: f64,
    pub remove_tilt: bool,
    /// Sodium layer thickness \[m\], 0 for no spot elongation
    pub elongation_depth: f64,
    /// Focus planes sampling the sodium layer
    pub n_elongation_layer: usize,
    /// Laser launch position in the pupil \[m\]
    pub launch_position: (f64, f64),
    pub noise: Option<NoiseDataSheet>,
}
impl Default for WfsConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::ShackHartmann,
            n_side_lenslet: 8,
            n_px_lenslet: 16,
            n_px_framelet: 8,
            osf: 2,
            threshold: 0.5,
            noise: None,
            guide_star_position: (0f64, 0f64),
            guide_star_height: None,
            wavelength: 500e-9,
            remove_tilt: false,
            elongation_depth: 0f64,
            n_elongation_layer: 5,
            launch_position: (0f64, 0f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    pub kind: DmKind,
    pub n_actuator_side: usize,
    /// Zernike radial order (modal mirror)
    pub radial_order: u32,
    pub coupling: f64,
    /// Stroke limit \[nm\]
    pub stroke: Option<f64>,
}
impl Default for DmConfig {
    fn default() -> Self {
        Self {
            kind: DmKind::Zonal,
            n_actuator_side: 9,
            radial_order: 4,
            coupling: 0.15,
            stroke: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScienceConfig {
    pub wavelength: f64,
    pub osf: usize,
}
impl Default for ScienceConfig {
    fn default() -> Self {
        Self {
            wavelength: 1.65e-6,
            osf: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub mode: LoopMode,
    pub gain: f64,
    pub leak: f64,
    /// Interaction matrix poke amplitude \[nm\]
    pub poke_amplitude: f64,
    /// Relative singular value truncation threshold
    pub sv_threshold: f64,
}
impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            mode: LoopMode::Closed,
            gain: 0.5,
            leak: 1.0,
            poke_amplitude: 50.0,
            sv_threshold: 1e-6,
        }
    }
}

/// Complete simulation description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sim: SimConfig,
    pub telescope: TelescopeConfig,
    pub atmosphere: AtmosphereConfig,
    pub wfs: Vec<WfsConfig>,
    pub dm: Vec<DmConfig>,
    pub science: ScienceConfig,
    pub control: ControlConfig,
}
impl Default for Config {
    /// A single 8x8 Shack-Hartmann closing the loop on a 9x9 zonal mirror
    fn default() -> Self {
        Self {
            sim: Default::default(),
            telescope: Default::default(),
            atmosphere: Default::default(),
            wfs: vec![WfsConfig::default()],
            dm: vec![DmConfig::default()],
            science: Default::default(),
            control: Default::default(),
        }
    }
}
impl Config {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
    /// Cross-component consistency checks
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sim.sampling_frequency <= 0f64 {
            return invalid("sim.sampling_frequency must be positive");
        }
        if self.telescope.diameter <= 0f64 {
            return invalid("telescope.diameter must be positive");
        }
        if self.telescope.obscuration >= self.telescope.diameter {
            return invalid("telescope.obscuration must be smaller than the diameter");
        }
        if self.telescope.n_px < 2 {
            return invalid("telescope.n_px is too small");
        }
        if self.atmosphere.r0_at_zenith <= 0f64 {
            return invalid("atmosphere.r0_at_zenith must be positive");
        }
        if self.atmosphere.has_custom_profile() {
            let n = self.atmosphere.xi0.len();
            if self.atmosphere.altitude.len() != n
                || self.atmosphere.wind_speed.len() != n
                || self.atmosphere.wind_direction.len() != n
            {
                return invalid("atmosphere profile arrays have mismatched lengths");
            }
            let sum: f64 = self.atmosphere.xi0.iter().sum();
            if (sum - 1f64).abs() > 1e-6 {
                return invalid(format!("atmosphere.xi0 must sum to 1, got {sum}"));
            }
        }
        if self.wfs.is_empty() {
            return invalid("at least one wavefront sensor is required");
        }
        for (k, wfs) in self.wfs.iter().enumerate() {
            if self.telescope.n_px != wfs.n_side_lenslet * wfs.n_px_lenslet {
                return invalid(format!(
                    "wfs[{k}]: {0}x{1}px lenslet array does not sample the {2}px pupil",
                    wfs.n_side_lenslet,
                    wfs.n_px_lenslet,
                    self.telescope.n_px
                ));
            }
            if !(0f64..=1f64).contains(&wfs.threshold) {
                return invalid(format!("wfs[{k}]: threshold must be in [0,1]"));
            }
        }
        if self.dm.is_empty() {
            return invalid("at least one deformable mirror is required");
        }
        for (k, dm) in self.dm.iter().enumerate() {
            match dm.kind {
                DmKind::Zonal if dm.n_actuator_side < 2 => {
                    return invalid(format!("dm[{k}]: a zonal mirror needs at least 2x2 actuators"))
                }
                DmKind::Modal if dm.radial_order == 0 => {
                    return invalid(format!("dm[{k}]: a modal mirror needs radial_order > 0"))
                }
                _ => {}
            }
        }
        if !(0f64..=1f64).contains(&self.control.gain) {
            return invalid("control.gain must be in [0,1]");
        }
        if !(0f64 < self.control.leak && self.control.leak <= 1f64) {
            return invalid("control.leak must be in (0,1]");
        }
        Ok(())
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let text =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [telescope]
            diameter = 4.0
            [[wfs]]
            n_side_lenslet = 16
            n_px_lenslet = 8
            [[dm]]
            kind = "modal"
            radial_order = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.telescope.diameter, 4.0);
        assert_eq!(config.wfs[0].n_side_lenslet, 16);
        assert_eq!(config.dm[0].kind, DmKind::Modal);
        assert_eq!(config.control.gain, 0.5);
        config.validate().unwrap();
    }

    #[test]
    fn profile_arrays_must_agree() {
        let mut config = Config::default();
        config.atmosphere.xi0 = vec![0.5, 0.5];
        config.atmosphere.altitude = vec![0f64];
        assert!(config.validate().is_err());
    }

    #[test]
    fn xi0_must_sum_to_one() {
        let mut config = Config::default();
        config.atmosphere.xi0 = vec![0.5, 0.3];
        config.atmosphere.altitude = vec![0f64, 5000f64];
        config.atmosphere.wind_speed = vec![10f64, 20f64];
        config.atmosphere.wind_direction = vec![0f64, 1f64];
        assert!(config.validate().is_err());
    }

    #[test]
    fn lenslet_tiling_is_checked() {
        let mut config = Config::default();
        // 7x16 = 112px does not tile a 128px pupil
        config.wfs[0].n_side_lenslet = 7;
        assert!(config.validate().is_err());
    }
}
