//! audio - Real-time PCM capture and playout bridge
//!
//! Moves fixed 10 ms S16LE blocks between an audio device and a media engine.
//! Uses ALSA for audio I/O and SpeexDSP for echo cancellation and noise
//! suppression; the low-latency playout buffer follows the device's underruns.

pub mod alsa_device;
mod audio_system;
pub mod buffer_manager;
pub mod callbacks;
pub mod context;
pub mod device;
pub mod diagnostics;
pub mod effects;
pub mod format;
mod play;
mod record;
pub mod session;
pub mod session_effects;
mod speex;
pub mod thread_checker;
pub mod worker;

pub use audio_system::{AudioConfig, AudioSystem};
pub use callbacks::{
    AudioSamples, Callbacks, CaptureSink, PipelineState, PlayoutSource, StreamEvent, StreamKind,
};
pub use context::AudioContext;
pub use diagnostics::SessionMatch;
pub use play::PlaybackPipeline;
pub use record::CapturePipeline;
pub use session::{negotiate, SessionParameters};
