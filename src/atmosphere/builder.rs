use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{AoError, Builder};

use super::{
    screen::PhaseScreen,
    store::{PhaseScreenStore, PickleScreenStore},
    Atmosphere, AtmosphereError, TurbulenceLayer,
};

/// Relative layer strengths, altitudes and winds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurbulenceProfile {
    pub n_layer: usize,
    pub altitude: Vec<f64>,
    pub xi0: Vec<f64>,
    pub wind_speed: Vec<f64>,
    pub wind_direction: Vec<f64>,
}
impl Default for TurbulenceProfile {
    fn default() -> Self {
        TurbulenceProfile {
            n_layer: 7,
            altitude: [25.0, 275.0, 425.0, 1_250.0, 4_000.0, 8_000.0, 13_000.0].to_vec(),
            xi0: [0.1257, 0.0874, 0.0666, 0.3498, 0.2273, 0.0681, 0.0751].to_vec(),
            wind_speed: [5.6540, 5.7964, 5.8942, 6.6370, 13.2925, 34.8250, 29.4187].to_vec(),
            wind_direction: [0.0136, 0.1441, 0.2177, 0.5672, 1.2584, 1.6266, 1.7462].to_vec(),
        }
    }
}

/// Phase screen sampling
///
/// Default properties:
///  * n_px  : 512px
///  * delta : 0.05m
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    pub n_px: usize,
    pub delta: f64,
}
impl Default for ScreenGeometry {
    fn default() -> Self {
        Self {
            n_px: 512,
            delta: 0.05,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AtmosphereBuilderError {
    #[error("cannot open `::aoloop::AtmosphereBuilder` toml file: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("cannot create `::aoloop::AtmosphereBuilder` toml file: {1}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("cannot read `::aoloop::AtmosphereBuilder` toml file: {1}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("cannot write `::aoloop::AtmosphereBuilder` toml file: {1}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("cannot deserialize `::aoloop::AtmosphereBuilder` from toml")]
    Load(#[from] toml::de::Error),
    #[error("cannot serialize `::aoloop::AtmosphereBuilder` into toml")]
    Save(#[from] toml::ser::Error),
    #[error(
        "turbulence profile is inconsistent: {0} layers but {1} values for `{2}`"
    )]
    Profile(usize, usize, &'static str),
}

/// [`Atmosphere`] builder
///
/// Default properties:
///  * r0           : 16cm
///  * L0           : 25m
///  * zenith angle : 30 degrees
///  * turbulence profile:
///    * n_layer        : 7
///    * altitude       : [25.0, 275.0, 425.0, 1250.0, 4000.0, 8000.0, 13000.0] m
///    * xi0            : [0.1257, 0.0874, 0.0666, 0.3498, 0.2273, 0.0681, 0.0751]
///    * wind speed     : [5.6540, 5.7964, 5.8942, 6.6370, 13.2925, 34.8250, 29.4187] m/s
///    * wind direction : [0.0136, 0.1441, 0.2177, 0.5672, 1.2584, 1.6266, 1.7462] rd
///  * screens      : 512px @ 5cm/px, generated fresh with seed 2020
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtmosphereBuilder {
    pub r0_at_zenith: f64,
    pub oscale: f64,
    pub zenith_angle: f64,
    pub seed: u64,
    pub new_screens: bool,
    pub screen_names: Option<Vec<PathBuf>>,
    pub turbulence: TurbulenceProfile,
    pub screen: ScreenGeometry,
}
impl Default for AtmosphereBuilder {
    fn default() -> Self {
        AtmosphereBuilder {
            r0_at_zenith: 0.16,
            oscale: 25.,
            zenith_angle: 30_f64.to_radians(),
            seed: 2020,
            new_screens: true,
            screen_names: None,
            turbulence: TurbulenceProfile::default(),
            screen: ScreenGeometry::default(),
        }
    }
}

/// ## `Atmosphere` builder
impl AtmosphereBuilder {
    /// Load the atmospheric builder from a toml
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, AtmosphereBuilderError> {
        let mut file = File::open(&path)
            .map_err(|e| AtmosphereBuilderError::Open(e, path.as_ref().to_path_buf()))?;
        let mut toml = String::new();
        file.read_to_string(&mut toml)
            .map_err(|e| AtmosphereBuilderError::Read(e, path.as_ref().to_path_buf()))?;
        let builder: AtmosphereBuilder = toml::from_str(&toml)?;
        Ok(builder)
    }
    /// Save the atmospheric builder to a toml
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), AtmosphereBuilderError> {
        let toml = toml::to_string_pretty(self)?;
        let mut file = File::create(&path)
            .map_err(|e| AtmosphereBuilderError::Create(e, path.as_ref().to_path_buf()))?;
        write!(file, "# ::aoloop::AtmosphereBuilder\n\n{}", toml)
            .map_err(|e| AtmosphereBuilderError::Write(e, path.as_ref().to_path_buf()))?;
        Ok(())
    }
    /// Set r0 value taken at pointing the zenith in meters
    pub fn r0_at_zenith(self, r0_at_zenith: f64) -> Self {
        Self {
            r0_at_zenith,
            ..self
        }
    }
    /// Set outer scale value in meters
    pub fn oscale(self, oscale: f64) -> Self {
        Self { oscale, ..self }
    }
    /// Set zenith angle value in radians
    pub fn zenith_angle(self, zenith_angle: f64) -> Self {
        Self {
            zenith_angle,
            ..self
        }
    }
    /// Set the turbulence profile
    pub fn turbulence_profile(self, turbulence: TurbulenceProfile) -> Self {
        Self { turbulence, ..self }
    }
    /// Set a single turbulence layer
    pub fn single_turbulence_layer(
        self,
        altitude: f64,
        wind_speed: Option<f64>,
        wind_direction: Option<f64>,
    ) -> Self {
        Self {
            turbulence: TurbulenceProfile {
                n_layer: 1,
                altitude: vec![altitude],
                xi0: vec![1f64],
                wind_speed: vec![wind_speed.unwrap_or(0f64)],
                wind_direction: vec![wind_direction.unwrap_or(0f64)],
            },
            ..self
        }
    }
    /// Remove a turbulence layer specified by its zero based index
    pub fn remove_turbulence_layer(self, layer_idx: usize) -> Self {
        let mut turbulence = self.turbulence;
        turbulence.n_layer -= 1;
        turbulence.altitude.remove(layer_idx);
        turbulence.xi0.remove(layer_idx);
        turbulence.wind_speed.remove(layer_idx);
        turbulence.wind_direction.remove(layer_idx);
        Self { turbulence, ..self }
    }
    /// Set the phase screen sampling
    pub fn screen(self, n_px: usize, delta: f64) -> Self {
        Self {
            screen: ScreenGeometry { n_px, delta },
            ..self
        }
    }
    /// Set the random generator seed for screen synthesis
    pub fn seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
    /// Load the phase screens from files instead of synthesizing them,
    /// one file per turbulence layer
    pub fn screens_from(self, screen_names: Vec<PathBuf>) -> Self {
        Self {
            new_screens: false,
            screen_names: Some(screen_names),
            ..self
        }
    }
    /// Build the [`Atmosphere`] loading screens through the given store
    pub fn build_with_store(
        self,
        store: &dyn PhaseScreenStore,
    ) -> std::result::Result<Atmosphere, AtmosphereError> {
        let profile = &self.turbulence;
        for (values, name) in [
            (profile.altitude.len(), "altitude"),
            (profile.xi0.len(), "xi0"),
            (profile.wind_speed.len(), "wind_speed"),
            (profile.wind_direction.len(), "wind_direction"),
        ] {
            if values != profile.n_layer {
                return Err(
                    AtmosphereBuilderError::Profile(profile.n_layer, values, name).into(),
                );
            }
        }
        let secz = 1f64 / self.zenith_angle.cos();
        let r0 = (self.r0_at_zenith.powf(-5.0 / 3.0) * secz).powf(-3.0 / 5.0);
        log::info!(
            "Atmosphere r0 at {:.1}degree from zenith: {:.3}m",
            self.zenith_angle.to_degrees(),
            r0
        );
        let screens = if self.new_screens {
            (0..profile.n_layer)
                .map(|k| {
                    // each layer carries its fraction of the integrated
                    // turbulence strength
                    let r0_layer = r0 * profile.xi0[k].powf(-3.0 / 5.0);
                    PhaseScreen::von_karman(
                        self.screen.n_px,
                        self.screen.delta,
                        r0_layer,
                        Some(self.oscale),
                        self.seed.wrapping_add(k as u64),
                    )
                })
                .collect::<Vec<_>>()
        } else {
            let names = self.screen_names.as_deref().unwrap_or(&[]);
            if names.len() != profile.n_layer {
                return Err(AtmosphereError::ScreenCount {
                    expected: profile.n_layer,
                    found: names.len(),
                });
            }
            names
                .iter()
                .enumerate()
                .map(|(k, name)| {
                    log::info!("Looking up phase screen from file {:?}", name);
                    let r0_layer = r0 * profile.xi0[k].powf(-3.0 / 5.0);
                    store.load(name).map(|stored| {
                        stored.into_screen(self.screen.delta, r0_layer, Some(self.oscale))
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        let layers = screens
            .into_iter()
            .enumerate()
            .map(|(k, screen)| {
                TurbulenceLayer::new(
                    profile.altitude[k] * secz,
                    profile.wind_speed[k] / secz,
                    profile.wind_direction[k],
                    profile.xi0[k],
                    screen,
                )
            })
            .collect();
        Ok(Atmosphere {
            layers,
            r0_at_zenith: self.r0_at_zenith,
            oscale: self.oscale,
            zenith_angle: self.zenith_angle,
            secs: 0f64,
        })
    }
}
impl Builder for AtmosphereBuilder {
    type Component = Atmosphere;
    /// Build the [`Atmosphere`] with the default file-backed screen store
    fn build(self) -> std::result::Result<Atmosphere, AoError> {
        Ok(self.build_with_store(&PickleScreenStore)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atmosphere::store::StoredScreen;

    #[test]
    fn toml_roundtrip() {
        let dir = std::env::temp_dir().join("aoloop-atm-builder");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("atm_builder.toml");
        let builder = AtmosphereBuilder::default().r0_at_zenith(0.15).seed(7);
        builder.save(&path).unwrap();
        let back = AtmosphereBuilder::load(&path).unwrap();
        assert_eq!(builder, back);
    }

    #[test]
    fn inconsistent_profile_is_rejected() {
        let mut profile = TurbulenceProfile::default();
        profile.wind_speed.pop();
        let result = AtmosphereBuilder::default()
            .turbulence_profile(profile)
            .build_with_store(&PickleScreenStore);
        assert!(matches!(
            result,
            Err(AtmosphereError::Builder(AtmosphereBuilderError::Profile(..)))
        ));
    }

    #[test]
    fn untagged_file_screen_loads_unscaled() {
        let dir = std::env::temp_dir().join("aoloop-atm-load");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("layer0.pkl");
        let values: Vec<f64> = (0..64 * 64).map(|k| (k % 17) as f64).collect();
        PickleScreenStore
            .store(
                &path,
                &StoredScreen {
                    values: values.clone(),
                    n: 64,
                    r0_px: None,
                },
            )
            .unwrap();
        let atm = AtmosphereBuilder::default()
            .single_turbulence_layer(0f64, None, None)
            .screen(64, 0.1)
            .screens_from(vec![path])
            .build_with_store(&PickleScreenStore)
            .unwrap();
        assert_eq!(atm.layers()[0].screen().as_slice(), values.as_slice());
    }

    #[test]
    fn screen_count_mismatch() {
        let result = AtmosphereBuilder::default()
            .screens_from(vec![PathBuf::from("only-one.pkl")])
            .build_with_store(&PickleScreenStore);
        assert!(matches!(result, Err(AtmosphereError::ScreenCount { .. })));
    }
}
