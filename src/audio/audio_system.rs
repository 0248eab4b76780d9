//! The AudioSystem facade that drives the capture and playout pipelines.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O; tokio only
//! runs the diagnostics jobs.

use std::sync::Arc;
use std::time::Duration;

use super::alsa_device::AlsaBackend;
use super::callbacks::{Callbacks, CaptureSink, PipelineState, PlayoutSource};
use super::context::AudioContext;
use super::device::{AudioBackend, AudioSource};
use super::effects::EffectsPlatform;
use super::play::PlaybackPipeline;
use super::record::CapturePipeline;
use super::session::{negotiate, SessionParameters};
use super::session_effects::{SessionEffectRegistry, SpeexEffectsPlatform};
use crate::config::Config;
use crate::error::AudioError;

/// Audio system configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Session sample rate; None picks the platform's native output rate
    pub sample_rate: Option<u32>,
    /// 1 (mono) or 2 (stereo)
    pub channels: u16,
    pub audio_source: AudioSource,
    /// Capture device buffer = factor × platform minimum
    pub record_buffer_factor: f64,
    /// Playout device buffer = factor × platform minimum; > 1 disables low latency
    pub playout_buffer_factor: f64,
    pub low_latency: bool,
    /// SCHED_FIFO priority for the audio threads (0 = leave as is)
    pub realtime_priority: i32,
    pub enable_aec: bool,
    pub enable_ns: bool,
    pub verify_delay: Duration,
    pub stats_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            sample_rate: None,
            channels: 1,
            audio_source: AudioSource::VoiceCommunication,
            record_buffer_factor: 2.0,
            playout_buffer_factor: 1.0,
            low_latency: true,
            realtime_priority: 0,
            enable_aec: true,
            enable_ns: true,
            verify_delay: Duration::from_millis(100),
            stats_interval: Duration::from_secs(30),
            join_timeout: Duration::from_millis(2000),
        }
    }
}

impl From<&Config> for AudioConfig {
    fn from(config: &Config) -> Self {
        let audio_source = AudioSource::parse(config.audio_source).unwrap_or_else(|| {
            log::warn!(
                "Unknown audio source '{}', using voice_communication",
                config.audio_source
            );
            AudioSource::VoiceCommunication
        });
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            sample_rate: (config.sample_rate != 0).then_some(config.sample_rate),
            channels: config.channels,
            audio_source,
            record_buffer_factor: config.record_buffer_factor,
            playout_buffer_factor: config.playout_buffer_factor,
            low_latency: config.low_latency,
            realtime_priority: config.realtime_priority,
            enable_aec: config.enable_aec,
            enable_ns: config.enable_ns,
            verify_delay: Duration::from_millis(config.verify_delay_ms),
            stats_interval: Duration::from_secs(config.stats_interval_secs),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
        }
    }
}

/// Both pipelines plus the process-wide context they share.
///
/// - Capture thread: device → `CaptureSink::on_frame_captured`
/// - Playout thread: `PlayoutSource::on_frame_requested` → device
pub struct AudioSystem {
    config: AudioConfig,
    backend: Arc<dyn AudioBackend>,
    ctx: Arc<AudioContext>,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
}

impl AudioSystem {
    /// `ctx` is the process-wide context; systems created from the same
    /// context share its mute flags and effect descriptors.
    pub fn new(
        ctx: Arc<AudioContext>,
        config: AudioConfig,
        backend: Arc<dyn AudioBackend>,
        effects: Arc<dyn EffectsPlatform>,
        sink: Arc<dyn CaptureSink>,
        source: Arc<dyn PlayoutSource>,
        callbacks: Callbacks,
    ) -> Self {
        let capture = CapturePipeline::new(
            ctx.clone(),
            backend.clone(),
            effects,
            sink,
            callbacks.clone(),
            config.clone(),
        );
        let playback =
            PlaybackPipeline::new(ctx.clone(), backend.clone(), source, callbacks, config.clone());
        Self {
            config,
            backend,
            ctx,
            capture,
            playback,
        }
    }

    /// ALSA devices with SpeexDSP effects.
    pub fn with_alsa(
        ctx: Arc<AudioContext>,
        config: AudioConfig,
        sink: Arc<dyn CaptureSink>,
        source: Arc<dyn PlayoutSource>,
        callbacks: Callbacks,
    ) -> Self {
        let registry = SessionEffectRegistry::new();
        let backend = Arc::new(AlsaBackend::new(
            &config.capture_device,
            &config.playback_device,
            config.low_latency,
            registry.clone(),
        ));
        let effects = Arc::new(SpeexEffectsPlatform::new(registry));
        Self::new(ctx, config, backend, effects, sink, source, callbacks)
    }

    /// Negotiate the session, then init and start playout and capture.
    ///
    /// Panics unless both pipelines are idle. On any failure both pipelines
    /// are stopped again.
    pub fn start(&mut self) -> Result<SessionParameters, AudioError> {
        assert!(
            self.capture.state() == PipelineState::Idle
                && self.playback.state() == PipelineState::Idle,
            "AudioSystem start() requires both pipelines idle; call stop() first"
        );
        log::info!(
            "AudioSystem starting: capture: \"{}\", playback: \"{}\", ch: {}",
            self.config.capture_device,
            self.config.playback_device,
            self.config.channels,
        );
        let params = negotiate(&*self.backend, self.config.sample_rate, self.config.channels);

        if !self.capture.request_aec(self.config.enable_aec) && self.config.enable_aec {
            log::warn!("AEC requested but not available");
        }
        if !self.capture.request_ns(self.config.enable_ns) && self.config.enable_ns {
            log::warn!("NS requested but not available");
        }

        let result = self.start_pipelines(&params);
        if result.is_err() {
            self.stop();
        }
        result.map(|()| params)
    }

    fn start_pipelines(&mut self, params: &SessionParameters) -> Result<(), AudioError> {
        self.playback.init(params.sample_rate, params.channels)?;
        self.capture.init(params.sample_rate, params.channels)?;
        self.playback.start()?;
        self.capture.start()?;
        Ok(())
    }

    /// Stop both pipelines. Returns false when neither was active.
    pub fn stop(&mut self) -> bool {
        let capture = self.capture.stop();
        let playback = self.playback.stop();
        capture || playback
    }

    pub fn set_speaker_mute(&self, mute: bool) {
        self.ctx.set_speaker_mute(mute);
    }

    pub fn set_microphone_mute(&self, mute: bool) {
        self.ctx.set_microphone_mute(mute);
    }

    pub fn capture(&mut self) -> &mut CapturePipeline {
        &mut self.capture
    }

    pub fn playback(&mut self) -> &mut PlaybackPipeline {
        &mut self.playback
    }

    pub fn context(&self) -> &Arc<AudioContext> {
        &self.ctx
    }
}
