use crate::audio::codec::DecodeError;
use crate::transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CallError>;

/// Errors surfaced by the call pipeline.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device acquisition and stream failures. Permission denial is kept
/// distinguishable from generic unavailability so the session can map them
/// to different terminal states.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Audio configuration error: {0}")]
    Config(String),
}

impl DeviceError {
    /// True when the failure should land the session in `PermissionDenied`
    /// rather than `Error`.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, DeviceError::PermissionDenied(_))
    }
}
