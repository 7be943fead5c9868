//!
//! # Closed-loop adaptive optics simulation
//!
//! `aoloop` simulates a complete adaptive-optics correction chain for a
//! ground-based telescope: synthetic atmospheric turbulence is sensed by one
//! or more wavefront sensors, corrected by one or more deformable mirrors
//! driven by a matrix-vector reconstructor and the residual wavefront is
//! accumulated into a long-exposure science image.
//!
//! Components are created with the builder associated to each component.
//! For example, a default atmosphere and an 8x8 geometric Shack-Hartmann
//! are built with:
//! ```no_run
//! use aoloop::{Builder, FromBuilder, Atmosphere, ShackHartmann, Geometric};
//! # fn main() -> aoloop::Result<()> {
//! let mut atm = Atmosphere::builder().build()?;
//! let wfs = ShackHartmann::<Geometric>::builder()
//!     .lenslet_array(8, 16, 8f64 / 8f64)
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//! [`ao!`](macro.ao.html) is a macro that incorporates the necessary
//! boilerplate code to create the simulation components.
//!
//! A full closed loop is driven by [`Simulation`]: [`Simulation::calibrate`]
//! records the interaction matrix once, then [`Simulation::run_loop`] or
//! [`Simulation::step`] advance the atmosphere, measure the residual
//! wavefront, reconstruct the mirror commands and accumulate the science
//! image.

pub mod atmosphere;
pub mod calibration;
pub mod config;
pub mod dm;
pub mod error;
pub mod fft;
pub mod guidestar;
pub mod mask;
pub mod phase;
pub mod reconstructor;
pub mod science;
pub mod sim;
pub mod wavefrontsensor;

#[doc(inline)]
pub use self::atmosphere::{Atmosphere, AtmosphereBuilder, PhaseScreen, TurbulenceProfile};
#[doc(inline)]
pub use self::calibration::{Calibration, Calibrator};
#[doc(inline)]
pub use self::config::Config;
#[doc(inline)]
pub use self::dm::{DeformableMirror, ModalDm, ZonalDm};
#[doc(inline)]
pub use self::error::AoError;
#[doc(inline)]
pub use self::guidestar::{GuideStar, GuideStarBuilder};
#[doc(inline)]
pub use self::mask::Pupil;
#[doc(inline)]
pub use self::phase::PhaseMap;
#[doc(inline)]
pub use self::reconstructor::{LoopMode, Reconstructor};
#[doc(inline)]
pub use self::science::ScienceCamera;
#[doc(inline)]
pub use self::sim::{IterationResult, Simulation};
#[doc(inline)]
pub use self::wavefrontsensor::{
    Diffractive, Geometric, Pyramid, ShackHartmann, Slopes, WavefrontSensor,
};

pub use skyangle::Conversion;

pub type Result<T> = std::result::Result<T, AoError>;

/// Component builder type trait
///
/// A builder is the only way to create a simulation component; it holds the
/// component parameters and [`Builder::build`] consumes it into the
/// component proper.
pub trait Builder: Default {
    type Component;
    fn new() -> Self {
        Default::default()
    }
    fn build(self) -> Result<Self::Component>;
}

/// Trait returning the builder associated to a component
pub trait FromBuilder {
    type ComponentBuilder: Builder;
    fn builder() -> Self::ComponentBuilder {
        Default::default()
    }
}

/// Component builder macro
///
/// One macro to rule them all, one macro to find them, one macro to bring
/// them all and in the darkness bind them all
///
/// # Examples
///
///  * Atmosphere
///
/// ```no_run
/// use aoloop::ao;
/// let atm = ao!(Atmosphere, r0_at_zenith = [0.15], oscale = [30.]);
/// ```
///
///  * Geometric Shack-Hartmann
///
/// ```no_run
/// use aoloop::ao;
/// let wfs = ao!(ShackHartmann:Geometric, lenslet_array = [8, 16, 1.]);
/// ```
#[macro_export]
macro_rules! ao {
    ($element:ident) => {
        $crate::Builder::build(<$crate::$element as $crate::FromBuilder>::builder()).unwrap()
    };
    ($element:ident, $($arg:ident = [$($val:expr),*]),*) => {
        $crate::Builder::build(<$crate::$element as $crate::FromBuilder>::builder()$(.$arg($($val),*))*).unwrap()
    };
    ($element:ident:$model:ident) => {
        $crate::Builder::build(<$crate::$element<$crate::$model> as $crate::FromBuilder>::builder()).unwrap()
    };
    ($element:ident:$model:ident, $($arg:ident = [$($val:expr),*]),*) => {
        $crate::Builder::build(<$crate::$element<$crate::$model> as $crate::FromBuilder>::builder()$(.$arg($($val),*))*).unwrap()
    };
}
