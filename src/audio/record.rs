//! Capture pipeline: device → 10 ms blocks → engine.
//!
//! Control operations (`init`, `start`, `stop`, ...) belong to one control
//! thread. The blocking read loop runs on its own real-time thread while the
//! pipeline is running.

use std::sync::Arc;

use bytes::Bytes;

use super::audio_system::AudioConfig;
use super::callbacks::{
    AudioSamples, Callbacks, CaptureSink, PipelineState, StreamEvent, StreamKind,
};
use super::context::AudioContext;
use super::device::{
    AudioBackend, DeviceState, RecordDevice, RecordParams, RecordingState, SessionId,
};
use super::diagnostics::{
    log_audio_state, verify_recording_session, ScheduledTask, SessionMatch, SessionMatchCell,
};
use super::effects::{EffectsController, EffectsPlatform};
use super::format::{AudioSessionConfig, FrameBuffer};
use super::thread_checker::ThreadChecker;
use super::worker::{KeepAlive, RealtimeWorker};
use crate::error::{AudioError, StartErrorCode};

enum Stage {
    Idle,
    Initialized {
        device: Arc<dyn RecordDevice>,
        buffer: FrameBuffer,
        format: AudioSessionConfig,
    },
    Running {
        device: Arc<dyn RecordDevice>,
        worker: RealtimeWorker,
        verification: ScheduledTask,
    },
}

impl Stage {
    fn device(&self) -> Option<&Arc<dyn RecordDevice>> {
        match self {
            Stage::Idle => None,
            Stage::Initialized { device, .. } | Stage::Running { device, .. } => Some(device),
        }
    }
}

pub struct CapturePipeline {
    ctx: Arc<AudioContext>,
    backend: Arc<dyn AudioBackend>,
    sink: Arc<dyn CaptureSink>,
    callbacks: Callbacks,
    config: AudioConfig,
    effects: EffectsController,
    thread_checker: ThreadChecker,
    preferred_device: Option<String>,
    session_match: Arc<SessionMatchCell>,
    stage: Stage,
}

impl CapturePipeline {
    pub fn new(
        ctx: Arc<AudioContext>,
        backend: Arc<dyn AudioBackend>,
        effects_platform: Arc<dyn EffectsPlatform>,
        sink: Arc<dyn CaptureSink>,
        callbacks: Callbacks,
        config: AudioConfig,
    ) -> Self {
        Self {
            effects: EffectsController::new(ctx.clone(), effects_platform),
            ctx,
            backend,
            sink,
            callbacks,
            config,
            thread_checker: ThreadChecker::new(),
            preferred_device: None,
            session_match: Arc::new(SessionMatchCell::default()),
            stage: Stage::Idle,
        }
    }

    fn fail_init(&self, message: impl Into<String>) -> AudioError {
        let err = AudioError::Init(message.into());
        self.callbacks.report_error(StreamKind::Capture, &err);
        err
    }

    fn fail_start(&self, code: StartErrorCode, message: String) -> AudioError {
        let err = AudioError::Start { code, message };
        self.callbacks.report_error(StreamKind::Capture, &err);
        err
    }

    /// Open the capture device. Returns the frames in one 10 ms block.
    pub fn init(&mut self, sample_rate: u32, channels: u16) -> Result<usize, AudioError> {
        self.thread_checker.check();
        log::info!("Capture init(sample_rate={}, channels={})", sample_rate, channels);
        if !matches!(self.stage, Stage::Idle) {
            return Err(self.fail_init("init called twice without stop"));
        }

        let format = AudioSessionConfig::new(sample_rate, channels, self.config.record_buffer_factor)
            .map_err(|e| self.fail_init(e))?;
        let buffer = FrameBuffer::for_config(&format);
        log::debug!("Capture block: {} bytes", buffer.capacity());

        let min_buffer_bytes = self
            .backend
            .min_record_buffer_bytes(sample_rate, channels)
            .map_err(|e| self.fail_init(format!("minimum record buffer query failed: {}", e)))?;
        let buffer_size_bytes =
            ((min_buffer_bytes as f64 * format.buffer_size_factor) as usize).max(buffer.capacity());
        log::info!(
            "Capture buffer: min={} bytes, factor={}, using {} bytes",
            min_buffer_bytes,
            format.buffer_size_factor,
            buffer_size_bytes
        );

        let device = self
            .backend
            .open_record(&RecordParams {
                source: self.config.audio_source,
                config: format,
                buffer_size_bytes,
                preferred_device: self.preferred_device.clone(),
            })
            .map_err(|e| self.fail_init(format!("capture device creation failed: {}", e)))?;
        let state = device.state();
        if state != DeviceState::Initialized {
            return Err(self.fail_init(format!("capture device in state {:?} after creation", state)));
        }
        self.sink.on_buffer_cached(buffer.capacity());

        log::info!(
            "Capture initialized: session={}, rate={}, channels={}, frames/buffer={}",
            device.session_id(),
            format.sample_rate,
            format.channels,
            format.frames_per_buffer()
        );
        self.session_match.set(SessionMatch::Unknown);
        let frames = format.frames_per_buffer();
        self.stage = Stage::Initialized {
            device,
            buffer,
            format,
        };
        Ok(frames)
    }

    /// Start capturing. Panics unless the pipeline is initialized and not yet running.
    pub fn start(&mut self) -> Result<(), AudioError> {
        self.thread_checker.check();
        log::info!("Capture start");
        assert!(
            matches!(self.stage, Stage::Initialized { .. }),
            "capture start() requires init() and no running session"
        );
        let Stage::Initialized {
            device,
            buffer,
            format,
        } = std::mem::replace(&mut self.stage, Stage::Idle)
        else {
            unreachable!()
        };

        if let Err(e) = device.start() {
            return Err(self.fail_start(
                StartErrorCode::Exception,
                format!("capture device start failed: {}", e),
            ));
        }
        let recording_state = device.recording_state();
        if recording_state != RecordingState::Recording {
            if let Err(e) = device.stop() {
                log::warn!("Capture device stop after failed start: {}", e);
            }
            return Err(self.fail_start(
                StartErrorCode::StateMismatch,
                format!("capture device is {:?} after start", recording_state),
            ));
        }

        self.effects.attach(device.session_id());
        log::info!(
            "Capture effects for session {}: aec={}, ns={}",
            device.session_id(),
            self.effects.aec_requested(),
            self.effects.ns_requested()
        );

        let worker = {
            let device = device.clone();
            let ctx = self.ctx.clone();
            let sink = self.sink.clone();
            let callbacks = self.callbacks.clone();
            RealtimeWorker::spawn("audio-capture", self.config.realtime_priority, move |keep_alive| {
                capture_loop(keep_alive, device, buffer, format, ctx, sink, callbacks)
            })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.effects.detach();
                if let Err(e) = device.stop() {
                    log::warn!("Capture device stop after failed start: {}", e);
                }
                return Err(self.fail_start(
                    StartErrorCode::Exception,
                    format!("capture thread spawn failed: {}", e),
                ));
            }
        };
        self.callbacks.report_state(StreamKind::Capture, StreamEvent::Started);

        let verification = {
            let backend = self.backend.clone();
            let device = device.clone();
            let cell = self.session_match.clone();
            self.ctx
                .scheduler()
                .schedule_after(self.config.verify_delay, move || {
                    verify_recording_session(&*backend, &device.recording_config(), &cell);
                })
        };

        self.stage = Stage::Running {
            device,
            worker,
            verification,
        };
        Ok(())
    }

    /// Stop capturing and release the device. Returns false when nothing was active.
    pub fn stop(&mut self) -> bool {
        self.thread_checker.check();
        log::info!("Capture stop");
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Idle => false,
            Stage::Initialized { device, .. } => {
                log::debug!("Releasing capture session {}", device.session_id());
                true
            }
            Stage::Running {
                device,
                worker,
                verification,
            } => {
                verification.cancel();
                if !worker.stop_and_join(self.config.join_timeout) {
                    log_audio_state("Capture", &device.snapshot());
                }
                self.effects.detach();
                log::debug!("Releasing capture session {}", device.session_id());
                true
            }
        }
    }

    pub fn state(&self) -> PipelineState {
        match self.stage {
            Stage::Idle => PipelineState::Idle,
            Stage::Initialized { .. } => PipelineState::Initialized,
            Stage::Running { .. } => PipelineState::Running,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.stage.device().map(|d| d.session_id())
    }

    /// Result of the last post-start session verification.
    pub fn is_session_matching(&self) -> SessionMatch {
        self.session_match.get()
    }

    /// Route capture to `device` (None for the default). Applies at the next
    /// init when the open device cannot be rerouted.
    pub fn set_preferred_device(&mut self, device: Option<String>) {
        self.thread_checker.check();
        log::info!("Capture preferred device: {:?}", device);
        if let Some(open) = self.stage.device() {
            if !open.set_preferred_device(device.as_deref()) {
                log::info!("Capture route change deferred to the next init");
            }
        }
        self.preferred_device = device;
    }

    pub fn is_aec_supported(&self) -> bool {
        self.effects.is_aec_supported()
    }

    pub fn is_ns_supported(&self) -> bool {
        self.effects.is_ns_supported()
    }

    pub fn request_aec(&mut self, enable: bool) -> bool {
        self.effects.request_aec(enable)
    }

    pub fn request_ns(&mut self, enable: bool) -> bool {
        self.effects.request_ns(enable)
    }

    pub fn thread_checker(&self) -> &ThreadChecker {
        &self.thread_checker
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(
    keep_alive: KeepAlive,
    device: Arc<dyn RecordDevice>,
    mut buffer: FrameBuffer,
    format: AudioSessionConfig,
    ctx: Arc<AudioContext>,
    sink: Arc<dyn CaptureSink>,
    callbacks: Callbacks,
) {
    let capacity = buffer.capacity();
    log::debug!("Capture loop running, {} bytes per block", capacity);

    while keep_alive.is_alive() {
        match device.read(buffer.as_mut_slice()) {
            Ok(n) if n == capacity => {
                if ctx.microphone_muted() {
                    buffer.fill_silence();
                }
                if keep_alive.is_alive() {
                    let timestamp = device.timestamp_ns().unwrap_or(0);
                    sink.on_frame_captured(buffer.as_slice(), timestamp);
                }
                if let Some(observer) = &callbacks.samples {
                    observer.on_samples_ready(AudioSamples {
                        format: format.format,
                        channels: format.channels,
                        sample_rate: format.sample_rate,
                        data: Bytes::copy_from_slice(buffer.as_slice()),
                    });
                }
            }
            Ok(n) => log::warn!("Short capture read: {} of {} bytes", n, capacity),
            Err(e) if e.is_fatal() => {
                keep_alive.clear();
                callbacks.report_error(
                    StreamKind::Capture,
                    &AudioError::Runtime(format!("capture read failed: {}", e)),
                );
            }
            Err(e) => log::warn!("Capture read error: {}", e),
        }
    }

    if let Err(e) = device.stop() {
        log::error!("Capture device stop failed: {}", e);
    }
    log::debug!("Capture loop exited");
    callbacks.report_state(StreamKind::Capture, StreamEvent::Stopped);
}
