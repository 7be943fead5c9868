use serde::{Deserialize, Serialize};
use skyangle::Conversion;

use crate::{Builder, FromBuilder, Result};

/// A wavefront sensing or science beacon
///
/// The position is an offset from the optical axis; natural guide stars sit
/// at infinity (`height: None`) while laser guide stars have a finite
/// altitude, which introduces the cone effect when the line-of-sight phase
/// is composed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideStar {
    /// Offset from the optical axis in radians
    pub position: (f64, f64),
    /// Beacon altitude in meters, `None` for an infinite-altitude source
    pub height: Option<f64>,
    /// Photometric wavelength in meters
    pub wavelength: f64,
    pub magnitude: f64,
}
impl GuideStar {
    /// An on-axis natural guide star at 500nm
    pub fn on_axis() -> Self {
        GuideStarBuilder::default().build().unwrap()
    }
    /// Phase to radians conversion factor at the beacon wavelength
    ///
    /// The simulation carries the wavefront as optical path difference in
    /// nanometers.
    pub fn phase_to_radians(&self) -> f64 {
        2.0 * std::f64::consts::PI * 1e-9 / self.wavelength
    }
}
impl FromBuilder for GuideStar {
    type ComponentBuilder = GuideStarBuilder;
}

/// `GuideStar` builder
///
/// Default properties:
///  - position  : on-axis
///  - height    : infinity
///  - wavelength: 500nm
///  - magnitude : 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideStarBuilder {
    position_arcsec: (f64, f64),
    height: Option<f64>,
    wavelength: f64,
    magnitude: f64,
}
impl Default for GuideStarBuilder {
    fn default() -> Self {
        Self {
            position_arcsec: (0f64, 0f64),
            height: None,
            wavelength: 500e-9,
            magnitude: 0f64,
        }
    }
}
impl GuideStarBuilder {
    /// Set the offset from the optical axis in arcseconds
    pub fn position(self, x_arcsec: f64, y_arcsec: f64) -> Self {
        Self {
            position_arcsec: (x_arcsec, y_arcsec),
            ..self
        }
    }
    /// Set the beacon altitude in meters (laser guide star)
    pub fn height(self, height: f64) -> Self {
        Self {
            height: Some(height),
            ..self
        }
    }
    /// Set the photometric wavelength in meters
    pub fn wavelength(self, wavelength: f64) -> Self {
        Self { wavelength, ..self }
    }
    pub fn magnitude(self, magnitude: f64) -> Self {
        Self { magnitude, ..self }
    }
}
impl Builder for GuideStarBuilder {
    type Component = GuideStar;
    fn build(self) -> Result<GuideStar> {
        Ok(GuideStar {
            position: (
                self.position_arcsec.0.from_arcsec(),
                self.position_arcsec.1.from_arcsec(),
            ),
            height: self.height,
            wavelength: self.wavelength,
            magnitude: self.magnitude,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_axis_is_at_infinity() {
        let gs = GuideStar::on_axis();
        assert!(gs.height.is_none());
        assert_eq!(gs.position, (0f64, 0f64));
    }

    #[test]
    fn position_conversion() {
        let gs = GuideStarBuilder::default()
            .position(10f64, 0f64)
            .build()
            .unwrap();
        assert!((gs.position.0 - 10f64.from_arcsec()).abs() < 1e-15);
    }
}
