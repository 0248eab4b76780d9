//! Playout pipeline: engine → 10 ms blocks → device.
//!
//! In low-latency mode the device buffer starts at the platform minimum and
//! the playout thread resizes it after every write, see `buffer_manager`.

use std::sync::Arc;

use super::audio_system::AudioConfig;
use super::buffer_manager::LowLatencyBufferManager;
use super::callbacks::{Callbacks, PipelineState, PlayoutSource, StreamEvent, StreamKind};
use super::context::AudioContext;
use super::device::{AudioBackend, DeviceState, PlayState, PlaybackDevice, PlaybackParams, SessionId};
use super::diagnostics::{log_audio_state, ScheduledTask};
use super::format::{AudioSessionConfig, FrameBuffer};
use super::thread_checker::ThreadChecker;
use super::worker::{KeepAlive, RealtimeWorker};
use crate::error::{AudioError, StartErrorCode};

enum Stage {
    Idle,
    Initialized {
        device: Arc<dyn PlaybackDevice>,
        buffer: FrameBuffer,
    },
    Running {
        device: Arc<dyn PlaybackDevice>,
        worker: RealtimeWorker,
        stats: ScheduledTask,
    },
}

impl Stage {
    fn device(&self) -> Option<&Arc<dyn PlaybackDevice>> {
        match self {
            Stage::Idle => None,
            Stage::Initialized { device, .. } | Stage::Running { device, .. } => Some(device),
        }
    }
}

pub struct PlaybackPipeline {
    ctx: Arc<AudioContext>,
    backend: Arc<dyn AudioBackend>,
    source: Arc<dyn PlayoutSource>,
    callbacks: Callbacks,
    config: AudioConfig,
    thread_checker: ThreadChecker,
    preferred_device: Option<String>,
    low_latency: bool,
    initial_buffer_size_in_frames: Option<usize>,
    stage: Stage,
}

impl PlaybackPipeline {
    pub fn new(
        ctx: Arc<AudioContext>,
        backend: Arc<dyn AudioBackend>,
        source: Arc<dyn PlayoutSource>,
        callbacks: Callbacks,
        config: AudioConfig,
    ) -> Self {
        Self {
            ctx,
            backend,
            source,
            callbacks,
            config,
            thread_checker: ThreadChecker::new(),
            preferred_device: None,
            low_latency: false,
            initial_buffer_size_in_frames: None,
            stage: Stage::Idle,
        }
    }

    fn fail_init(&self, message: impl Into<String>) -> AudioError {
        let err = AudioError::Init(message.into());
        self.callbacks.report_error(StreamKind::Playback, &err);
        err
    }

    fn fail_start(&self, code: StartErrorCode, message: String) -> AudioError {
        let err = AudioError::Start { code, message };
        self.callbacks.report_error(StreamKind::Playback, &err);
        err
    }

    /// Open the playback device. Returns the frames in one 10 ms block.
    pub fn init(&mut self, sample_rate: u32, channels: u16) -> Result<usize, AudioError> {
        self.thread_checker.check();
        log::info!("Playout init(sample_rate={}, channels={})", sample_rate, channels);
        if !matches!(self.stage, Stage::Idle) {
            return Err(self.fail_init("init called twice without stop"));
        }

        let format = AudioSessionConfig::new(sample_rate, channels, self.config.playout_buffer_factor)
            .map_err(|e| self.fail_init(e))?;
        let buffer = FrameBuffer::for_config(&format);
        log::debug!("Playout block: {} bytes", buffer.capacity());

        let min_buffer_bytes = self
            .backend
            .min_playback_buffer_bytes(sample_rate, channels)
            .map_err(|e| self.fail_init(format!("minimum playback buffer query failed: {}", e)))?;
        if min_buffer_bytes < buffer.capacity() {
            log::warn!(
                "Minimum playback buffer {} bytes is smaller than one block, using {}",
                min_buffer_bytes,
                buffer.capacity()
            );
        }

        let platform_low_latency = self.backend.low_latency_output_frames(sample_rate).is_some();
        let low_latency = self.config.low_latency
            && platform_low_latency
            && format.buffer_size_factor <= 1.0;
        if self.config.low_latency && platform_low_latency && !low_latency {
            log::info!(
                "Buffer size factor {} > 1, low-latency playout disabled",
                format.buffer_size_factor
            );
        }
        let buffer_size_bytes = if low_latency {
            min_buffer_bytes.max(buffer.capacity())
        } else {
            ((min_buffer_bytes as f64 * format.buffer_size_factor) as usize).max(buffer.capacity())
        };
        log::info!(
            "Playout buffer: min={} bytes, factor={}, low_latency={}, using {} bytes",
            min_buffer_bytes,
            format.buffer_size_factor,
            low_latency,
            buffer_size_bytes
        );

        let device = self
            .backend
            .open_playback(&PlaybackParams {
                config: format,
                buffer_size_bytes,
                low_latency,
                preferred_device: self.preferred_device.clone(),
            })
            .map_err(|e| self.fail_init(format!("playback device creation failed: {}", e)))?;
        let state = device.state();
        if state != DeviceState::Initialized {
            return Err(self.fail_init(format!("playback device in state {:?} after creation", state)));
        }
        self.source.on_buffer_cached(buffer.capacity());

        let initial = device.buffer_size_in_frames();
        log::info!(
            "Playout initialized: session={}, buffer={} frames, capacity={} frames",
            device.session_id(),
            initial,
            device.buffer_capacity_in_frames()
        );
        self.low_latency = low_latency;
        self.initial_buffer_size_in_frames = Some(initial);
        self.stage = Stage::Initialized { device, buffer };
        Ok(format.frames_per_buffer())
    }

    /// Start playout. Panics unless the pipeline is initialized and not yet running.
    pub fn start(&mut self) -> Result<(), AudioError> {
        self.thread_checker.check();
        log::info!("Playout start");
        assert!(
            matches!(self.stage, Stage::Initialized { .. }),
            "playout start() requires init() and no running session"
        );
        let Stage::Initialized { device, buffer } = std::mem::replace(&mut self.stage, Stage::Idle)
        else {
            unreachable!()
        };

        if let Err(e) = device.start() {
            return Err(self.fail_start(
                StartErrorCode::Exception,
                format!("playback device start failed: {}", e),
            ));
        }
        let play_state = device.play_state();
        if play_state != PlayState::Playing {
            if let Err(e) = device.stop() {
                log::warn!("Playback device stop after failed start: {}", e);
            }
            return Err(self.fail_start(
                StartErrorCode::StateMismatch,
                format!("playback device is {:?} after start", play_state),
            ));
        }

        let worker = {
            let device = device.clone();
            let ctx = self.ctx.clone();
            let source = self.source.clone();
            let callbacks = self.callbacks.clone();
            let low_latency = self.low_latency;
            RealtimeWorker::spawn("audio-playout", self.config.realtime_priority, move |keep_alive| {
                playout_loop(keep_alive, device, buffer, ctx, source, callbacks, low_latency)
            })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(e) = device.stop() {
                    log::warn!("Playback device stop after failed start: {}", e);
                }
                return Err(self.fail_start(
                    StartErrorCode::Exception,
                    format!("playout thread spawn failed: {}", e),
                ));
            }
        };
        self.callbacks.report_state(StreamKind::Playback, StreamEvent::Started);

        let stats = {
            let device = device.clone();
            self.ctx
                .scheduler()
                .schedule_every(self.config.stats_interval, move || {
                    log::info!(
                        "Playout stats: session={}, buffer={} frames, underruns={:?}",
                        device.session_id(),
                        device.buffer_size_in_frames(),
                        device.underrun_count()
                    );
                })
        };

        self.stage = Stage::Running {
            device,
            worker,
            stats,
        };
        Ok(())
    }

    /// Stop playout and release the device. Returns false when nothing was active.
    pub fn stop(&mut self) -> bool {
        self.thread_checker.check();
        log::info!("Playout stop");
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let active = match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Idle => false,
            Stage::Initialized { device, .. } => {
                log::debug!("Releasing playback session {}", device.session_id());
                true
            }
            Stage::Running {
                device,
                worker,
                stats,
            } => {
                stats.cancel();
                if !worker.stop_and_join(self.config.join_timeout) {
                    log_audio_state("Playout", &device.snapshot());
                }
                log::info!(
                    "Playout session {} ended with {:?} underruns",
                    device.session_id(),
                    device.underrun_count()
                );
                true
            }
        };
        self.low_latency = false;
        active
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

    /// Current device buffer size; None while idle.
    pub fn buffer_size_in_frames(&self) -> Option<usize> {
        self.stage.device().map(|d| d.buffer_size_in_frames())
    }

    /// Buffer size recorded at the last successful init.
    pub fn initial_buffer_size_in_frames(&self) -> Option<usize> {
        self.initial_buffer_size_in_frames
    }

    pub fn underrun_count(&self) -> Option<u32> {
        self.stage.device().and_then(|d| d.underrun_count())
    }

    pub fn is_low_latency(&self) -> bool {
        self.low_latency
    }

    /// Route playout to `device` (None for the default). Applies at the next
    /// init when the open device cannot be rerouted.
    pub fn set_preferred_device(&mut self, device: Option<String>) {
        self.thread_checker.check();
        log::info!("Playout preferred device: {:?}", device);
        if let Some(open) = self.stage.device() {
            if !open.set_preferred_device(device.as_deref()) {
                log::info!("Playout route change deferred to the next init");
            }
        }
        self.preferred_device = device;
    }

    pub fn thread_checker(&self) -> &ThreadChecker {
        &self.thread_checker
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn playout_loop(
    keep_alive: KeepAlive,
    device: Arc<dyn PlaybackDevice>,
    mut buffer: FrameBuffer,
    ctx: Arc<AudioContext>,
    source: Arc<dyn PlayoutSource>,
    callbacks: Callbacks,
    low_latency: bool,
) {
    let capacity = buffer.capacity();
    let mut buffer_manager = low_latency.then(LowLatencyBufferManager::new);
    log::debug!(
        "Playout loop running, {} bytes per block, low_latency={}",
        capacity,
        low_latency
    );

    while keep_alive.is_alive() {
        source.on_frame_requested(buffer.as_mut_slice());
        if ctx.speaker_muted() {
            buffer.fill_silence();
        }

        let failure = match device.write(buffer.as_slice()) {
            Ok(n) if n == capacity => None,
            Ok(n) => Some(format!("short playback write: {} of {} bytes", n, capacity)),
            Err(e) => Some(format!("playback write failed: {}", e)),
        };
        if let Some(message) = failure {
            keep_alive.clear();
            callbacks.report_error(StreamKind::Playback, &AudioError::Runtime(message));
            break;
        }

        if let Some(manager) = buffer_manager.as_mut() {
            manager.maybe_adjust_buffer_size(&*device);
        }
    }

    if let Err(e) = device.stop() {
        log::error!("Playback device stop failed: {}", e);
    }
    log::debug!("Playout loop exited");
    callbacks.report_state(StreamKind::Playback, StreamEvent::Stopped);
}
