#[derive(Debug, thiserror::Error)]
pub enum AoError {
    #[error("invalid simulation configuration")]
    Config(#[from] crate::config::ConfigError),
    #[error("cannot build `::aoloop::Atmosphere`")]
    Atmosphere(#[from] crate::atmosphere::AtmosphereError),
    #[error("cannot build wavefront sensor")]
    WavefrontSensor(#[from] crate::wavefrontsensor::WavefrontSensorError),
    #[error("cannot build deformable mirror")]
    DeformableMirror(#[from] crate::dm::DmError),
    #[error("interaction matrix calibration failed")]
    Calibration(#[from] crate::calibration::CalibrationError),
    #[error("wavefront reconstruction failed")]
    Reconstructor(#[from] crate::reconstructor::ReconstructorError),
    #[error("non-finite value at element {0} of a measurement, command or wavefront, run aborted")]
    NumericAnomaly(usize),
    #[error("cannot persist run products")]
    Persistence(#[from] std::io::Error),
    #[error("cannot encode run products")]
    Encoding(#[from] serde_pickle::Error),
}
