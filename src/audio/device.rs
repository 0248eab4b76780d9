//! Platform seams: the device factory and the record/playback device handles.
//!
//! The pipelines only talk to these traits. `alsa_device` provides the Linux
//! implementation; tests provide in-memory ones.

use std::sync::Arc;

use serde::Serialize;

use super::format::{AudioSessionConfig, SampleFormat};
use crate::error::DeviceError;

/// Platform-assigned id tying a device instance to its effects and diagnostics.
pub type SessionId = u32;

/// What the capture device is recording for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    Default,
    Mic,
    VoiceCommunication,
    VoiceRecognition,
}

impl AudioSource {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "default" => Some(AudioSource::Default),
            "mic" => Some(AudioSource::Mic),
            "voice_communication" => Some(AudioSource::VoiceCommunication),
            "voice_recognition" => Some(AudioSource::VoiceRecognition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Uninitialized,
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordingState {
    Stopped,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayState {
    Stopped,
    Playing,
}

/// Describes one recording session, either ours or one the OS reports active.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingConfig {
    pub source: Option<AudioSource>,
    pub session_id: Option<SessionId>,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// Hardware location (card, device, subdevice) when known.
    pub location: Option<(i32, u32, u32)>,
    pub owner_pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RecordParams {
    pub source: AudioSource,
    pub config: AudioSessionConfig,
    pub buffer_size_bytes: usize,
    pub preferred_device: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlaybackParams {
    pub config: AudioSessionConfig,
    pub buffer_size_bytes: usize,
    pub low_latency: bool,
    pub preferred_device: Option<String>,
}

/// Diagnostic view of a device, logged when something goes wrong.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub session_id: SessionId,
    pub state: DeviceState,
    pub running: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size_in_frames: usize,
    pub underrun_count: Option<u32>,
}

pub trait RecordDevice: Send + Sync {
    fn session_id(&self) -> SessionId;
    fn state(&self) -> DeviceState;
    fn start(&self) -> Result<(), DeviceError>;
    fn recording_state(&self) -> RecordingState;

    /// Blocking read of up to `buf.len()` bytes. Returns the bytes read.
    fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    fn stop(&self) -> Result<(), DeviceError>;

    /// Monotonic capture time of the last block read, in nanoseconds.
    fn timestamp_ns(&self) -> Option<i64>;

    /// Returns false when the route cannot change while the device is open.
    fn set_preferred_device(&self, device: Option<&str>) -> bool;

    fn recording_config(&self) -> RecordingConfig;
    fn snapshot(&self) -> DeviceSnapshot;
}

/// The knobs the low-latency buffer manager turns.
pub trait BufferSizeControl {
    /// `None` when the platform does not count underruns.
    fn underrun_count(&self) -> Option<u32>;
    fn buffer_size_in_frames(&self) -> usize;
    /// Returns the size actually applied.
    fn set_buffer_size_in_frames(&self, frames: usize) -> usize;
    fn playback_rate(&self) -> u32;
}

pub trait PlaybackDevice: BufferSizeControl + Send + Sync {
    fn session_id(&self) -> SessionId;
    fn state(&self) -> DeviceState;
    fn start(&self) -> Result<(), DeviceError>;
    fn play_state(&self) -> PlayState;

    /// Blocking write of `buf`. Returns the bytes written.
    fn write(&self, buf: &[u8]) -> Result<usize, DeviceError>;

    fn stop(&self) -> Result<(), DeviceError>;
    fn buffer_capacity_in_frames(&self) -> usize;
    fn set_preferred_device(&self, device: Option<&str>) -> bool;
    fn snapshot(&self) -> DeviceSnapshot;
}

/// Opens devices and answers capability queries.
pub trait AudioBackend: Send + Sync {
    fn min_record_buffer_bytes(&self, sample_rate: u32, channels: u16) -> Result<usize, DeviceError>;
    fn min_playback_buffer_bytes(&self, sample_rate: u32, channels: u16)
        -> Result<usize, DeviceError>;

    /// Frame count of the platform's low-latency output path, when it has one.
    fn low_latency_output_frames(&self, sample_rate: u32) -> Option<usize>;
    fn low_latency_input_frames(&self, sample_rate: u32) -> Option<usize>;
    fn native_output_sample_rate(&self) -> Option<u32>;

    fn open_record(&self, params: &RecordParams) -> Result<Arc<dyn RecordDevice>, DeviceError>;
    fn open_playback(&self, params: &PlaybackParams)
        -> Result<Arc<dyn PlaybackDevice>, DeviceError>;

    /// Recording sessions the OS currently reports active.
    fn active_recording_configs(&self) -> Result<Vec<RecordingConfig>, DeviceError>;
}
