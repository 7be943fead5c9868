use std::{fs::File, path::Path};

use serde::{Deserialize, Serialize};

use super::{AtmosphereError, PhaseScreen};

/// On-disk phase screen record
///
/// The array dimensions are trusted; the optional `r0_px` header tag gives
/// the Fried parameter of the stored statistics in pixel units and enables
/// rescaling the screen to the configured turbulence strength. Without the
/// tag the array is used numerically unscaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredScreen {
    pub values: Vec<f64>,
    pub n: usize,
    /// Fried parameter of the stored screen in pixel units, if tagged
    pub r0_px: Option<f64>,
}
impl StoredScreen {
    /// Realizes the screen with the configured geometry and strength
    ///
    /// With an `r0_px` tag the screen is rescaled to the configured Fried
    /// parameter `r0` (in meters, converted to pixels with `delta`);
    /// otherwise the configured `r0`/`l0` are recorded as advisory only and
    /// the samples are left untouched.
    pub fn into_screen(self, delta: f64, r0: f64, l0: Option<f64>) -> PhaseScreen {
        match self.r0_px {
            Some(r0_px) => {
                let mut screen =
                    PhaseScreen::from_values(self.values, self.n, delta, r0_px * delta, l0);
                screen.rescale_to_r0(r0);
                screen
            }
            None => PhaseScreen::from_values(self.values, self.n, delta, r0, l0),
        }
    }
}

/// External phase screen storage
///
/// The simulation core only consumes this interface; the default
/// implementation is a pickle file per screen.
pub trait PhaseScreenStore {
    fn load(&self, path: &Path) -> Result<StoredScreen, AtmosphereError>;
    fn store(&self, path: &Path, screen: &StoredScreen) -> Result<(), AtmosphereError>;
}

/// File-backed store, one pickle file per screen
#[derive(Debug, Default, Clone)]
pub struct PickleScreenStore;
impl PhaseScreenStore for PickleScreenStore {
    fn load(&self, path: &Path) -> Result<StoredScreen, AtmosphereError> {
        let file = File::open(path)
            .map_err(|e| AtmosphereError::ScreenFile(e, path.to_path_buf()))?;
        serde_pickle::from_reader(file, Default::default())
            .map_err(|e| AtmosphereError::ScreenFormat(e, path.to_path_buf()))
    }
    fn store(&self, path: &Path, screen: &StoredScreen) -> Result<(), AtmosphereError> {
        let mut file = File::create(path)
            .map_err(|e| AtmosphereError::ScreenFile(e, path.to_path_buf()))?;
        serde_pickle::to_writer(&mut file, screen, Default::default())
            .map_err(|e| AtmosphereError::ScreenFormat(e, path.to_path_buf()))
    }
}
