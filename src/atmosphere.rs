use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{guidestar::GuideStar, phase::PhaseMap, FromBuilder};

mod builder;
pub mod screen;
pub mod store;
pub use builder::{AtmosphereBuilder, AtmosphereBuilderError, TurbulenceProfile};
pub use screen::PhaseScreen;
pub use store::{PhaseScreenStore, PickleScreenStore, StoredScreen};

#[derive(Debug, thiserror::Error)]
pub enum AtmosphereError {
    #[error("cannot create `::aoloop::AtmosphereBuilder`")]
    Builder(#[from] AtmosphereBuilderError),
    #[error("cannot access phase screen file {1}")]
    ScreenFile(#[source] std::io::Error, PathBuf),
    #[error("cannot decode phase screen file {1}")]
    ScreenFormat(#[source] serde_pickle::Error, PathBuf),
    #[error("expected {expected} phase screen files, found {found}")]
    ScreenCount { expected: usize, found: usize },
    #[error(
        "footprint at layer {layer} (altitude {altitude}m) requires a \
         {required:.1}m screen, stored screen extent is {available:.1}m"
    )]
    FootprintExceedsScreen {
        layer: usize,
        altitude: f64,
        required: f64,
        available: f64,
    },
}
pub type Result<T> = std::result::Result<T, AtmosphereError>;

/// One turbulence layer
///
/// A layer owns its phase screen together with the wind vector that scrolls
/// it; `xi0` is the fractional contribution of the layer to the integrated
/// turbulence strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurbulenceLayer {
    pub altitude: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub xi0: f64,
    screen: PhaseScreen,
    // fractional scroll residual [px]
    scroll: (f64, f64),
}
impl TurbulenceLayer {
    pub(crate) fn new(
        altitude: f64,
        wind_speed: f64,
        wind_direction: f64,
        xi0: f64,
        screen: PhaseScreen,
    ) -> Self {
        Self {
            altitude,
            wind_speed,
            wind_direction,
            xi0,
            screen,
            scroll: (0f64, 0f64),
        }
    }
    pub fn screen(&self) -> &PhaseScreen {
        &self.screen
    }
    /// Scrolls the phase screen under the wind for `dt` seconds
    ///
    /// Whole pixel translations rotate the screen storage in place with
    /// wrap-around boundaries; the sub-pixel remainder is carried over and
    /// applied at interpolation time.
    fn advance(&mut self, dt: f64) {
        let delta = self.screen.delta();
        let di = self.scroll.0 + self.wind_speed * self.wind_direction.cos() * dt / delta;
        let dj = self.scroll.1 + self.wind_speed * self.wind_direction.sin() * dt / delta;
        let (wi, wj) = (di.floor(), dj.floor());
        self.screen.rotate(wi as isize, wj as isize);
        self.scroll = (di - wi, dj - wj);
    }
}

/// Multi-layer atmospheric turbulence model
///
/// The atmosphere owns its [`TurbulenceLayer`]s; each iteration
/// [`Atmosphere::advance`] scrolls every screen under its wind vector and
/// [`Atmosphere::compose`] integrates the line-of-sight phase towards a
/// [`GuideStar`] through all layers.
pub struct Atmosphere {
    pub(crate) layers: Vec<TurbulenceLayer>,
    pub r0_at_zenith: f64,
    pub oscale: f64,
    pub zenith_angle: f64,
    pub secs: f64,
}
impl FromBuilder for Atmosphere {
    type ComponentBuilder = AtmosphereBuilder;
}
impl Atmosphere {
    /// Fried parameter along the line of sight
    pub fn r0(&self) -> f64 {
        let secz = 1f64 / self.zenith_angle.cos();
        (self.r0_at_zenith.powf(-5.0 / 3.0) * secz).powf(-3.0 / 5.0)
    }
    pub fn n_layer(&self) -> usize {
        self.layers.len()
    }
    pub fn layers(&self) -> &[TurbulenceLayer] {
        &self.layers
    }
    /// Advances every layer by `dt` seconds of wind translation
    pub fn advance(&mut self, dt: f64) {
        self.secs += dt;
        self.layers.iter_mut().for_each(|layer| layer.advance(dt));
    }
    /// Composes the line-of-sight phase towards `gs` over an `n_px` pupil
    /// grid with a `delta` meters pixel scale
    ///
    /// The aperture footprint is back-projected to each layer altitude,
    /// shrunk by the cone effect for a finite-altitude beacon, shifted by
    /// the beacon angular offset and extracted by bilinear interpolation;
    /// layer contributions add up into a single phase map.
    ///
    /// Layers at or above a laser beacon altitude do not contribute.
    pub fn compose(&self, gs: &GuideStar, n_px: usize, delta: f64) -> Result<PhaseMap> {
        let mut phase = PhaseMap::zeroed(n_px, delta);
        let c_p = 0.5 * (n_px as f64 - 1.0);
        for (k, layer) in self.layers.iter().enumerate() {
            let scale = match gs.height {
                Some(h_gs) if layer.altitude >= h_gs => continue,
                Some(h_gs) => 1.0 - layer.altitude / h_gs,
                None => 1.0,
            };
            let screen = &layer.screen;
            let n_s = screen.n() as f64;
            let c_s = 0.5 * (n_s - 1.0);
            let delta_s = screen.delta();
            // offset of the meta-pupil center at the layer altitude [m]
            let (u_m, v_m) = (
                gs.position.0 * layer.altitude,
                gs.position.1 * layer.altitude,
            );
            let half_extent = c_p * delta * scale + u_m.abs().max(v_m.abs());
            let available = c_s * delta_s;
            if half_extent > available + 0.5 * delta_s {
                return Err(AtmosphereError::FootprintExceedsScreen {
                    layer: k,
                    altitude: layer.altitude,
                    required: 2.0 * half_extent,
                    available: 2.0 * available,
                });
            }
            for i in 0..n_px {
                let x = ((i as f64 - c_p) * delta * scale + u_m) / delta_s + c_s;
                for j in 0..n_px {
                    let y = ((j as f64 - c_p) * delta * scale + v_m) / delta_s + c_s;
                    let sample =
                        screen.bilinear(x + layer.scroll.0, y + layer.scroll.1);
                    phase.set(i, j, phase.get(i, j) + sample);
                }
            }
        }
        Ok(phase)
    }
    /// Rewinds the atmosphere clock; the screens keep their realization
    pub fn reset(&mut self) {
        self.secs = 0f64;
        self.layers
            .iter_mut()
            .for_each(|layer| layer.scroll = (0f64, 0f64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Builder;

    fn single_layer(wind_speed: f64, n_px: usize) -> Atmosphere {
        AtmosphereBuilder::default()
            .single_turbulence_layer(0f64, Some(wind_speed), Some(0f64))
            .zenith_angle(0f64)
            .screen(n_px, 0.1)
            .build()
            .unwrap()
    }

    #[test]
    fn advance_is_periodic_over_a_full_screen() {
        // wind moves one pixel per step, one full period restores alignment
        let mut atm = single_layer(0.1, 32);
        let original = atm.layers[0].screen.clone();
        for _ in 0..32 {
            atm.advance(1.0);
        }
        assert_eq!(atm.layers[0].screen, original);
        assert!(atm.layers[0].scroll.0.abs() < 1e-9);
    }

    #[test]
    fn zero_wind_is_frozen() {
        let mut atm = single_layer(0f64, 32);
        let before = atm.compose(&GuideStar::on_axis(), 16, 0.1).unwrap();
        atm.advance(1.0);
        let after = atm.compose(&GuideStar::on_axis(), 16, 0.1).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn oversized_footprint_fails() {
        let atm = AtmosphereBuilder::default()
            .single_turbulence_layer(10_000f64, None, None)
            .zenith_angle(0f64)
            .screen(32, 0.1)
            .build()
            .unwrap();
        let gs = crate::GuideStarBuilder::default()
            .position(60f64, 0f64)
            .build()
            .unwrap();
        let result = atm.compose(&gs, 32, 0.1);
        assert!(matches!(
            result,
            Err(AtmosphereError::FootprintExceedsScreen { .. })
        ));
    }

    #[test]
    fn cone_effect_shrinks_footprint() {
        // a ground-only atmosphere is insensitive to the beacon altitude,
        // an elevated layer is sampled over a smaller extent
        let atm = AtmosphereBuilder::default()
            .single_turbulence_layer(5_000f64, None, None)
            .zenith_angle(0f64)
            .screen(64, 0.1)
            .build()
            .unwrap();
        let ngs = GuideStar::on_axis();
        let lgs = crate::GuideStarBuilder::default()
            .height(90_000f64)
            .build()
            .unwrap();
        let full = atm.compose(&ngs, 32, 0.1).unwrap();
        let cone = atm.compose(&lgs, 32, 0.1).unwrap();
        assert_ne!(full, cone);
    }
}
