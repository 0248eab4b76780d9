//! Session parameter negotiation against the platform.

use serde::Serialize;

use super::device::AudioBackend;
use super::format::{SampleFormat, BUFFERS_PER_SECOND};

/// Rate used when neither the host nor the platform names one.
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionParameters {
    pub sample_rate: u32,
    pub channels: u16,
    pub input_frames_per_buffer: usize,
    pub output_frames_per_buffer: usize,
    pub low_latency_output: bool,
    pub low_latency_input: bool,
}

/// Pick the session sample rate and the per-direction platform buffer sizes.
///
/// The rate is `requested_rate` if given, else the platform's native output
/// rate, else [`DEFAULT_SAMPLE_RATE`]. The channel count is not validated
/// here; pipeline init rejects unsupported formats.
pub fn negotiate(
    backend: &dyn AudioBackend,
    requested_rate: Option<u32>,
    channels: u16,
) -> SessionParameters {
    let sample_rate = requested_rate
        .or_else(|| backend.native_output_sample_rate())
        .unwrap_or(DEFAULT_SAMPLE_RATE);
    let bytes_per_frame = channels as usize * SampleFormat::S16Le.bytes_per_sample();
    let block_frames = (sample_rate / BUFFERS_PER_SECOND) as usize;

    let low_latency_output = backend.low_latency_output_frames(sample_rate);
    let low_latency_input = backend.low_latency_input_frames(sample_rate);

    let output_frames_per_buffer = low_latency_output.unwrap_or_else(|| {
        match backend.min_playback_buffer_bytes(sample_rate, channels) {
            Ok(bytes) => bytes.checked_div(bytes_per_frame).unwrap_or(block_frames),
            Err(e) => {
                log::warn!("Minimum playback buffer unknown ({}), assuming one block", e);
                block_frames
            }
        }
    });
    let input_frames_per_buffer = low_latency_input.unwrap_or_else(|| {
        match backend.min_record_buffer_bytes(sample_rate, channels) {
            Ok(bytes) => bytes.checked_div(bytes_per_frame).unwrap_or(block_frames),
            Err(e) => {
                log::warn!("Minimum record buffer unknown ({}), assuming one block", e);
                block_frames
            }
        }
    });

    let params = SessionParameters {
        sample_rate,
        channels,
        input_frames_per_buffer,
        output_frames_per_buffer,
        low_latency_output: low_latency_output.is_some(),
        low_latency_input: low_latency_input.is_some(),
    };
    log::info!("Negotiated audio session: {:?}", params);
    params
}
