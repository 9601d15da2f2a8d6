use thiserror::Error;

use crate::frame::CameraId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid parameter `{name}` = {value} (expected {min}..={max})")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Calibration for camera {camera:?} is required but absent")]
    MissingCalibration { camera: CameraId },

    #[error("Calibration Error: {0}")]
    Calibration(String),

    #[error("Config Parse Error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Playback speed can only be changed for file sources")]
    SpeedControlUnavailable,

    #[error("Session is closed")]
    SessionClosed,
}
