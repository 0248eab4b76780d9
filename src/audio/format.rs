//! PCM block geometry and the fixed-capacity frame buffer shared with the engine.

use bytes::BytesMut;
use serde::Serialize;

/// Blocks exchanged with the engine per second (10 ms granularity).
pub const BUFFERS_PER_SECOND: u32 = 100;

/// Duration of one block in milliseconds.
pub const CALLBACK_BUFFER_SIZE_MS: u32 = 1000 / BUFFERS_PER_SECOND;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian, interleaved.
    S16Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
        }
    }
}

/// Format of one capture or playout session. Fixed for the lifetime of an init.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioSessionConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub buffer_size_factor: f64,
}

impl AudioSessionConfig {
    pub fn new(sample_rate: u32, channels: u16, buffer_size_factor: f64) -> Result<Self, String> {
        if channels != 1 && channels != 2 {
            return Err(format!("unsupported channel count: {}", channels));
        }
        if sample_rate < BUFFERS_PER_SECOND {
            return Err(format!("unsupported sample rate: {}", sample_rate));
        }
        if !(buffer_size_factor > 0.0) {
            return Err(format!("invalid buffer size factor: {}", buffer_size_factor));
        }
        Ok(Self {
            sample_rate,
            channels,
            format: SampleFormat::S16Le,
            buffer_size_factor,
        })
    }

    /// Frames in one 10 ms block.
    pub fn frames_per_buffer(&self) -> usize {
        (self.sample_rate / BUFFERS_PER_SECOND) as usize
    }

    /// Bytes in one interleaved frame (all channels).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    /// Bytes in one 10 ms block.
    pub fn buffer_bytes(&self) -> usize {
        self.bytes_per_frame() * self.frames_per_buffer()
    }
}

/// One 10 ms block of interleaved PCM.
///
/// The allocation is made once per init and never grows, so every callback
/// that lends it out hands the engine the same memory.
#[derive(Debug)]
pub struct FrameBuffer {
    data: BytesMut,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::zeroed(capacity),
        }
    }

    pub fn for_config(config: &AudioSessionConfig) -> Self {
        Self::new(config.buffer_bytes())
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Overwrite the whole block with digital silence.
    pub fn fill_silence(&mut self) {
        self.data.fill(0);
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

/// Decode interleaved S16LE bytes into samples. Odd trailing bytes are ignored.
pub fn bytes_to_samples(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
}

/// Encode samples back into interleaved S16LE bytes.
pub fn samples_to_bytes(samples: &[i16], out: &mut [u8]) {
    for (dst, sample) in out.chunks_exact_mut(2).zip(samples) {
        dst.copy_from_slice(&sample.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_ms_at_48k_mono_is_480_frames() {
        let config = AudioSessionConfig::new(48000, 1, 1.0).unwrap();
        assert_eq!(config.frames_per_buffer(), 480);
        assert_eq!(config.buffer_bytes(), 960);
    }

    #[test]
    fn stereo_doubles_the_block() {
        let config = AudioSessionConfig::new(44100, 2, 1.0).unwrap();
        assert_eq!(config.frames_per_buffer(), 441);
        assert_eq!(config.buffer_bytes(), 441 * 4);
    }

    #[test]
    fn rejects_unsupported_layouts() {
        assert!(AudioSessionConfig::new(48000, 3, 1.0).is_err());
        assert!(AudioSessionConfig::new(0, 1, 1.0).is_err());
        assert!(AudioSessionConfig::new(48000, 1, 0.0).is_err());
    }

    #[test]
    fn buffer_keeps_its_allocation_when_silenced() {
        let mut buffer = FrameBuffer::new(960);
        let ptr = buffer.as_ptr();
        buffer.as_mut_slice()[10] = 7;
        buffer.fill_silence();
        assert_eq!(buffer.as_ptr(), ptr);
        assert!(buffer.as_slice().iter().all(|b| *b == 0));
        assert_eq!(buffer.capacity(), 960);
    }

    #[test]
    fn sample_conversion_is_little_endian() {
        let mut samples = Vec::new();
        bytes_to_samples(&[0x01, 0x00, 0xff, 0xff], &mut samples);
        assert_eq!(samples, vec![1, -1]);

        let mut bytes = [0u8; 4];
        samples_to_bytes(&[256, -2], &mut bytes);
        assert_eq!(bytes, [0x00, 0x01, 0xfe, 0xff]);
    }
}
