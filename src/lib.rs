pub mod audio;
pub mod config;
pub mod error;

pub use audio::{AudioConfig, AudioSystem};
pub use error::{AudioError, DeviceError, StartErrorCode};
