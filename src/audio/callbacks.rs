//! Frame-exchange contract with the media engine and host-facing callbacks.
//!
//! All callbacks run synchronously on the pipeline thread that raised them
//! (control thread for init/start errors, real-time thread otherwise), so
//! implementations must return quickly.

use std::sync::Arc;

use bytes::Bytes;

use super::format::SampleFormat;
use crate::error::AudioError;

/// Receives captured blocks.
pub trait CaptureSink: Send + Sync {
    /// Called once per init with the capacity of the block every later
    /// `on_frame_captured` call lends out.
    fn on_buffer_cached(&self, _capacity: usize) {}

    /// `frame.len()` is the byte count of the block; the timestamp is the
    /// monotonic capture time in nanoseconds, or 0 when unavailable.
    fn on_frame_captured(&self, frame: &[u8], capture_timestamp_ns: i64);
}

/// Supplies blocks for playout.
pub trait PlayoutSource: Send + Sync {
    fn on_buffer_cached(&self, _capacity: usize) {}

    /// Fill exactly `frame.len()` bytes before returning.
    fn on_frame_requested(&self, frame: &mut [u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Capture,
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Started,
    Stopped,
}

/// Lifecycle stage of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Initialized,
    Running,
}

pub trait ErrorCallback: Send + Sync {
    fn on_error(&self, kind: StreamKind, error: &AudioError);
}

pub trait StateCallback: Send + Sync {
    fn on_state_changed(&self, kind: StreamKind, event: StreamEvent);
}

/// A copy of one captured block plus its format.
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub data: Bytes,
}

pub trait SamplesObserver: Send + Sync {
    fn on_samples_ready(&self, samples: AudioSamples);
}

impl<F> ErrorCallback for F
where
    F: Fn(StreamKind, &AudioError) + Send + Sync,
{
    fn on_error(&self, kind: StreamKind, error: &AudioError) {
        self(kind, error)
    }
}

impl<F> StateCallback for F
where
    F: Fn(StreamKind, StreamEvent) + Send + Sync,
{
    fn on_state_changed(&self, kind: StreamKind, event: StreamEvent) {
        self(kind, event)
    }
}

impl<F> SamplesObserver for F
where
    F: Fn(AudioSamples) + Send + Sync,
{
    fn on_samples_ready(&self, samples: AudioSamples) {
        self(samples)
    }
}

/// The set of host callbacks one pipeline reports through.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub error: Option<Arc<dyn ErrorCallback>>,
    pub state: Option<Arc<dyn StateCallback>>,
    pub samples: Option<Arc<dyn SamplesObserver>>,
}

impl Callbacks {
    pub fn with_error(mut self, callback: Arc<dyn ErrorCallback>) -> Self {
        self.error = Some(callback);
        self
    }

    pub fn with_state(mut self, callback: Arc<dyn StateCallback>) -> Self {
        self.state = Some(callback);
        self
    }

    pub fn with_samples(mut self, observer: Arc<dyn SamplesObserver>) -> Self {
        self.samples = Some(observer);
        self
    }

    pub(crate) fn report_error(&self, kind: StreamKind, error: &AudioError) {
        log::error!("{:?} error: {}", kind, error);
        if let Some(cb) = &self.error {
            cb.on_error(kind, error);
        }
    }

    pub(crate) fn report_state(&self, kind: StreamKind, event: StreamEvent) {
        log::debug!("{:?} state: {:?}", kind, event);
        if let Some(cb) = &self.state {
            cb.on_state_changed(kind, event);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("error", &self.error.is_some())
            .field("state", &self.state.is_some())
            .field("samples", &self.samples.is_some())
            .finish()
    }
}
