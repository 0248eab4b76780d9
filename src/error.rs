//! Error taxonomy for the capture/playout pipelines and the platform layer.

use thiserror::Error;

/// Why `start()` failed. Resources are already released when this is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartErrorCode {
    /// The platform raised an error while starting the device.
    Exception,
    /// The device started but reports a state other than recording/playing.
    StateMismatch,
}

/// Errors surfaced to the host through the error callback and control results.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// Device could not be created or initialized; `start` must not be called.
    #[error("init failed: {0}")]
    Init(String),

    /// Start failed; the caller may retry after a fresh init.
    #[error("start failed ({code:?}): {message}")]
    Start { code: StartErrorCode, message: String },

    /// Fatal I/O failure inside a real-time loop; the loop has terminated.
    #[error("runtime failure: {0}")]
    Runtime(String),
}

/// Failures reported by the platform layer (ALSA, SpeexDSP, test doubles).
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device creation failed: {0}")]
    Creation(String),

    #[error("invalid device state: {0}")]
    InvalidState(String),

    /// The device can no longer perform I/O.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A recoverable I/O hiccup (e.g. an xrun that was recovered).
    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("ALSA error: {0}")]
    Alsa(#[from] alsa::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Whether a read/write loop must terminate after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::InvalidOperation(_) | DeviceError::InvalidState(_) | DeviceError::Alsa(_)
        )
    }
}
