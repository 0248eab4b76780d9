//! ALSA PCM devices for capture and playback, plus the ALSA `AudioBackend`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::device::{
    AudioBackend, AudioSource, BufferSizeControl, DeviceSnapshot, DeviceState, PlayState,
    PlaybackDevice, PlaybackParams, RecordDevice, RecordParams, RecordingConfig, RecordingState,
    SessionId,
};
use super::format::{SampleFormat, BUFFERS_PER_SECOND};
use super::session_effects::SessionEffectRegistry;
use crate::error::DeviceError;

/// Recoveries attempted for one block before giving up on it.
const MAX_RECOVERY_RETRIES: u32 = 3;

/// Extra 10 ms blocks of capacity a low-latency playout device keeps for growth.
const LOW_LATENCY_GROWTH_BLOCKS: usize = 5;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

impl AlsaParams {
    fn bytes_per_frame(&self) -> usize {
        self.channels as usize * SampleFormat::S16Le.bytes_per_sample()
    }
}

fn configure_hw(hwp: &HwParams, sample_rate: u32, channels: u32) -> Result<()> {
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(Format::S16LE)?;
    hwp.set_channels(channels)?;
    hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
    Ok(())
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    buffer_frames: usize,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        configure_hw(&hwp, sample_rate, channels)?;
        let period = (sample_rate / BUFFERS_PER_SECOND) as Frames;
        hwp.set_period_size_near(period, ValueOr::Nearest)?;
        hwp.set_buffer_size_near(buffer_frames.max(period as usize * 2) as Frames)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size, buffer_size) = {
        let hwp = pcm.hw_params_current()?;
        (
            hwp.get_rate()?,
            hwp.get_channels()?,
            hwp.get_period_size()? as usize,
            hwp.get_buffer_size()? as usize,
        )
    };

    // 10 ms blocks are exchanged with the engine, so the format must match exactly
    if actual_rate != sample_rate || actual_channels != channels {
        anyhow::bail!(
            "{} device '{}' negotiated {} Hz/{} ch instead of {} Hz/{} ch",
            dir_name,
            device,
            actual_rate,
            actual_channels,
            sample_rate,
            channels
        );
    }

    if direction == Direction::Playback {
        // start as soon as one period is queued
        let swp = pcm.sw_params_current()?;
        swp.set_start_threshold(period_size as Frames)?;
        pcm.sw_params(&swp)?;
    }

    let params = AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
        period_size,
        buffer_size,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
        buffer_size,
    );

    Ok((pcm, params))
}

fn query_min_buffer_bytes(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u16,
) -> Result<usize> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}'", device))?;
    let hwp = HwParams::any(&pcm)?;
    configure_hw(&hwp, sample_rate, channels as u32)?;
    let min_frames = hwp.get_buffer_size_min()?;
    if min_frames <= 0 {
        anyhow::bail!("device '{}' reported minimum buffer of {} frames", device, min_frames);
    }
    Ok(min_frames as usize * channels as usize * SampleFormat::S16Le.bytes_per_sample())
}

fn location_of(pcm: &PCM) -> Option<(i32, u32, u32)> {
    let info = pcm.info().ok()?;
    let card = info.get_card();
    (card >= 0).then(|| (card, info.get_device(), info.get_subdevice()))
}

fn monotonic_now_ns() -> Option<i64> {
    // SAFETY: timespec is plain old data; clock_gettime only writes into it.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (rc == 0).then(|| ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

fn lock_pcm(pcm: &Mutex<PCM>) -> MutexGuard<'_, PCM> {
    pcm.lock().unwrap_or_else(|e| e.into_inner())
}

// ======================== Capture ========================

pub struct AlsaRecordDevice {
    name: String,
    pcm: Mutex<PCM>,
    params: AlsaParams,
    source: AudioSource,
    session_id: SessionId,
    location: Option<(i32, u32, u32)>,
    registry: Arc<SessionEffectRegistry>,
    recording: AtomicBool,
    last_timestamp_ns: AtomicI64,
    preferred_device: Mutex<Option<String>>,
}

impl AlsaRecordDevice {
    fn open(
        name: &str,
        params: &RecordParams,
        session_id: SessionId,
        registry: Arc<SessionEffectRegistry>,
    ) -> Result<Self> {
        let config = &params.config;
        let buffer_frames = params.buffer_size_bytes / config.bytes_per_frame();
        let (pcm, alsa_params) = open_pcm(
            name,
            Direction::Capture,
            config.sample_rate,
            config.channels as u32,
            buffer_frames,
        )?;
        let location = location_of(&pcm);
        registry.register_session(session_id, config.sample_rate, config.channels);

        Ok(Self {
            name: name.to_string(),
            pcm: Mutex::new(pcm),
            params: alsa_params,
            source: params.source,
            session_id,
            location,
            registry,
            recording: AtomicBool::new(false),
            last_timestamp_ns: AtomicI64::new(-1),
            preferred_device: Mutex::new(params.preferred_device.clone()),
        })
    }
}

impl RecordDevice for AlsaRecordDevice {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn state(&self) -> DeviceState {
        DeviceState::Initialized
    }

    fn start(&self) -> Result<(), DeviceError> {
        let pcm = lock_pcm(&self.pcm);
        pcm.prepare()?;
        pcm.start()?;
        let state = pcm.state();
        log::debug!("Capture '{}' state after start: {:?}", self.name, state);
        self.recording.store(state == State::Running, Ordering::Release);
        Ok(())
    }

    fn recording_state(&self) -> RecordingState {
        if self.recording.load(Ordering::Acquire) {
            RecordingState::Recording
        } else {
            RecordingState::Stopped
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if !self.recording.load(Ordering::Acquire) {
            return Err(DeviceError::InvalidOperation("capture device is not recording".into()));
        }
        let frame_bytes = self.params.bytes_per_frame();
        let total_frames = buf.len() / frame_bytes;

        let pcm = lock_pcm(&self.pcm);
        let io = pcm.io_bytes();
        let mut frames_read = 0;
        let mut retry_count = 0u32;

        while frames_read < total_frames {
            match io.readi(&mut buf[frames_read * frame_bytes..total_frames * frame_bytes]) {
                Ok(0) => break,
                Ok(n) => {
                    frames_read += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        return Err(DeviceError::InvalidOperation(format!(
                            "Failed to recover PCM capture: {}",
                            e2
                        )));
                    }
                    if retry_count >= MAX_RECOVERY_RETRIES {
                        break;
                    }
                }
            }
        }

        // The last frame read left the ADC `delay` frames ago
        let timestamp = match (monotonic_now_ns(), pcm.delay()) {
            (Some(now), Ok(delay)) if delay >= 0 => {
                now - delay as i64 * 1_000_000_000 / self.params.sample_rate as i64
            }
            _ => -1,
        };
        drop(io);
        drop(pcm);
        self.last_timestamp_ns.store(timestamp, Ordering::Relaxed);

        let bytes = frames_read * frame_bytes;
        if bytes == buf.len() {
            self.registry.process_capture(self.session_id, buf);
        }
        Ok(bytes)
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.recording.store(false, Ordering::Release);
        PCM::drop(&lock_pcm(&self.pcm))?;
        Ok(())
    }

    fn timestamp_ns(&self) -> Option<i64> {
        let ts = self.last_timestamp_ns.load(Ordering::Relaxed);
        (ts >= 0).then_some(ts)
    }

    fn set_preferred_device(&self, device: Option<&str>) -> bool {
        *self.preferred_device.lock().unwrap_or_else(|e| e.into_inner()) = device.map(str::to_string);
        log::info!(
            "ALSA cannot reroute open capture device '{}'; {:?} applies on next init",
            self.name,
            device
        );
        false
    }

    fn recording_config(&self) -> RecordingConfig {
        RecordingConfig {
            source: Some(self.source),
            session_id: Some(self.session_id),
            sample_rate: self.params.sample_rate,
            channels: self.params.channels as u16,
            format: SampleFormat::S16Le,
            location: self.location,
            owner_pid: Some(std::process::id()),
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            name: self.name.clone(),
            session_id: self.session_id,
            state: DeviceState::Initialized,
            running: self.recording.load(Ordering::Acquire),
            sample_rate: self.params.sample_rate,
            channels: self.params.channels as u16,
            buffer_size_in_frames: self.params.buffer_size,
            underrun_count: None,
        }
    }
}

impl Drop for AlsaRecordDevice {
    fn drop(&mut self) {
        self.registry.unregister_session(self.session_id);
    }
}

// ======================== Playback ========================

pub struct AlsaPlaybackDevice {
    name: String,
    pcm: Mutex<PCM>,
    params: AlsaParams,
    session_id: SessionId,
    registry: Arc<SessionEffectRegistry>,
    playing: AtomicBool,
    underruns: AtomicU32,
    /// Frames we allow to be queued; at most `params.buffer_size`.
    target_frames: AtomicUsize,
    preferred_device: Mutex<Option<String>>,
}

impl AlsaPlaybackDevice {
    fn open(
        name: &str,
        params: &PlaybackParams,
        session_id: SessionId,
        registry: Arc<SessionEffectRegistry>,
    ) -> Result<Self> {
        let config = &params.config;
        let block = config.frames_per_buffer();
        let requested = (params.buffer_size_bytes / config.bytes_per_frame()).max(block);
        let capacity = if params.low_latency {
            requested + LOW_LATENCY_GROWTH_BLOCKS * block
        } else {
            requested
        };
        let (pcm, alsa_params) = open_pcm(
            name,
            Direction::Playback,
            config.sample_rate,
            config.channels as u32,
            capacity,
        )?;
        let target = requested.min(alsa_params.buffer_size);

        Ok(Self {
            name: name.to_string(),
            pcm: Mutex::new(pcm),
            params: alsa_params,
            session_id,
            registry,
            playing: AtomicBool::new(false),
            underruns: AtomicU32::new(0),
            target_frames: AtomicUsize::new(target),
            preferred_device: Mutex::new(params.preferred_device.clone()),
        })
    }

    /// Sleep until queuing `frames` more keeps the queue within the target size.
    fn wait_for_headroom(&self, pcm: &PCM, frames: usize) {
        let capacity = self.params.buffer_size;
        let target = self.target_frames.load(Ordering::Relaxed);
        if target >= capacity {
            return;
        }
        let Ok(avail) = pcm.avail_update() else {
            return;
        };
        let queued = capacity.saturating_sub(avail.max(0) as usize);
        if queued + frames > target {
            let excess = (queued + frames - target) as u64;
            std::thread::sleep(Duration::from_micros(
                excess * 1_000_000 / self.params.sample_rate as u64,
            ));
        }
    }
}

impl BufferSizeControl for AlsaPlaybackDevice {
    fn underrun_count(&self) -> Option<u32> {
        Some(self.underruns.load(Ordering::Relaxed))
    }

    fn buffer_size_in_frames(&self) -> usize {
        self.target_frames.load(Ordering::Relaxed)
    }

    fn set_buffer_size_in_frames(&self, frames: usize) -> usize {
        let applied = frames.clamp(self.params.period_size.min(self.params.buffer_size), self.params.buffer_size);
        self.target_frames.store(applied, Ordering::Relaxed);
        applied
    }

    fn playback_rate(&self) -> u32 {
        self.params.sample_rate
    }
}

impl PlaybackDevice for AlsaPlaybackDevice {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn state(&self) -> DeviceState {
        DeviceState::Initialized
    }

    fn start(&self) -> Result<(), DeviceError> {
        let pcm = lock_pcm(&self.pcm);
        pcm.prepare()?;
        let state = pcm.state();
        log::debug!("Playback '{}' state after start: {:?}", self.name, state);
        self.playing.store(
            matches!(state, State::Prepared | State::Running),
            Ordering::Release,
        );
        Ok(())
    }

    fn play_state(&self) -> PlayState {
        if self.playing.load(Ordering::Acquire) {
            PlayState::Playing
        } else {
            PlayState::Stopped
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, DeviceError> {
        if !self.playing.load(Ordering::Acquire) {
            return Err(DeviceError::InvalidOperation("playback device is not playing".into()));
        }
        let frame_bytes = self.params.bytes_per_frame();
        let total_frames = buf.len() / frame_bytes;

        let pcm = lock_pcm(&self.pcm);
        self.wait_for_headroom(&pcm, total_frames);
        let io = pcm.io_bytes();

        // Write with retry loop to handle short writes and XRUN recovery
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * frame_bytes;
            match io.writei(&buf[offset..total_frames * frame_bytes]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    if pcm.state() == State::XRun {
                        self.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    if let Err(e2) = pcm.prepare() {
                        return Err(DeviceError::InvalidOperation(format!(
                            "Failed to recover PCM playback: {}",
                            e2
                        )));
                    }

                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
        drop(io);
        drop(pcm);

        if frames_written == total_frames {
            self.registry
                .feed_far_end(self.params.sample_rate, self.params.channels as u16, buf);
        }
        Ok(frames_written * frame_bytes)
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.playing.store(false, Ordering::Release);
        PCM::drop(&lock_pcm(&self.pcm))?;
        Ok(())
    }

    fn buffer_capacity_in_frames(&self) -> usize {
        self.params.buffer_size
    }

    fn set_preferred_device(&self, device: Option<&str>) -> bool {
        *self.preferred_device.lock().unwrap_or_else(|e| e.into_inner()) = device.map(str::to_string);
        log::info!(
            "ALSA cannot reroute open playback device '{}'; {:?} applies on next init",
            self.name,
            device
        );
        false
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            name: self.name.clone(),
            session_id: self.session_id,
            state: DeviceState::Initialized,
            running: self.playing.load(Ordering::Acquire),
            sample_rate: self.params.sample_rate,
            channels: self.params.channels as u16,
            buffer_size_in_frames: self.target_frames.load(Ordering::Relaxed),
            underrun_count: Some(self.underruns.load(Ordering::Relaxed)),
        }
    }
}

// ======================== Backend ========================

/// Opens ALSA devices by name and reports capture activity from `/proc/asound`.
pub struct AlsaBackend {
    capture_device: String,
    playback_device: String,
    low_latency: bool,
    registry: Arc<SessionEffectRegistry>,
    next_session_id: AtomicU32,
    proc_root: PathBuf,
}

impl AlsaBackend {
    pub fn new(
        capture_device: &str,
        playback_device: &str,
        low_latency: bool,
        registry: Arc<SessionEffectRegistry>,
    ) -> Self {
        Self {
            capture_device: capture_device.to_string(),
            playback_device: playback_device.to_string(),
            low_latency,
            registry,
            next_session_id: AtomicU32::new(1),
            proc_root: PathBuf::from("/proc/asound"),
        }
    }

    fn allocate_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl AudioBackend for AlsaBackend {
    fn min_record_buffer_bytes(&self, sample_rate: u32, channels: u16) -> Result<usize, DeviceError> {
        query_min_buffer_bytes(&self.capture_device, Direction::Capture, sample_rate, channels)
            .map_err(|e| DeviceError::InvalidState(format!("{:#}", e)))
    }

    fn min_playback_buffer_bytes(
        &self,
        sample_rate: u32,
        channels: u16,
    ) -> Result<usize, DeviceError> {
        query_min_buffer_bytes(&self.playback_device, Direction::Playback, sample_rate, channels)
            .map_err(|e| DeviceError::InvalidState(format!("{:#}", e)))
    }

    fn low_latency_output_frames(&self, sample_rate: u32) -> Option<usize> {
        self.low_latency
            .then_some((sample_rate / BUFFERS_PER_SECOND) as usize)
    }

    fn low_latency_input_frames(&self, sample_rate: u32) -> Option<usize> {
        self.low_latency
            .then_some((sample_rate / BUFFERS_PER_SECOND) as usize)
    }

    fn native_output_sample_rate(&self) -> Option<u32> {
        None
    }

    fn open_record(&self, params: &RecordParams) -> Result<Arc<dyn RecordDevice>, DeviceError> {
        let name = params.preferred_device.as_deref().unwrap_or(&self.capture_device);
        let device = AlsaRecordDevice::open(name, params, self.allocate_session_id(), self.registry.clone())
            .map_err(|e| DeviceError::Creation(format!("{:#}", e)))?;
        Ok(Arc::new(device))
    }

    fn open_playback(
        &self,
        params: &PlaybackParams,
    ) -> Result<Arc<dyn PlaybackDevice>, DeviceError> {
        let name = params.preferred_device.as_deref().unwrap_or(&self.playback_device);
        let device =
            AlsaPlaybackDevice::open(name, params, self.allocate_session_id(), self.registry.clone())
                .map_err(|e| DeviceError::Creation(format!("{:#}", e)))?;
        Ok(Arc::new(device))
    }

    fn active_recording_configs(&self) -> Result<Vec<RecordingConfig>, DeviceError> {
        scan_active_captures(&self.proc_root)
    }
}

// ======================== /proc/asound ========================

fn proc_field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn numbered(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}

fn read_capture_substream(
    card: i32,
    device: u32,
    subdevice: u32,
    dir: &Path,
) -> Option<RecordingConfig> {
    let status = fs::read_to_string(dir.join("status")).ok()?;
    if proc_field(&status, "state")? != "RUNNING" {
        return None;
    }
    let owner_pid = proc_field(&status, "owner_pid").and_then(|v| v.parse().ok());

    let hw = fs::read_to_string(dir.join("hw_params")).ok()?;
    if proc_field(&hw, "format")? != "S16_LE" {
        return None;
    }
    let channels = proc_field(&hw, "channels")?.parse().ok()?;
    let sample_rate = proc_field(&hw, "rate")?.split_whitespace().next()?.parse().ok()?;

    Some(RecordingConfig {
        source: None,
        session_id: None,
        sample_rate,
        channels,
        format: SampleFormat::S16Le,
        location: Some((card, device, subdevice)),
        owner_pid,
    })
}

/// Running S16_LE capture substreams under an `/proc/asound`-shaped tree.
pub fn scan_active_captures(root: &Path) -> Result<Vec<RecordingConfig>, DeviceError> {
    let mut active = Vec::new();
    for card_entry in fs::read_dir(root)? {
        let card_entry = card_entry?;
        let Some(card) = card_entry
            .file_name()
            .to_str()
            .and_then(|n| numbered(n, "card", ""))
        else {
            continue;
        };
        let Ok(pcms) = fs::read_dir(card_entry.path()) else {
            continue;
        };
        for pcm_entry in pcms.flatten() {
            let Some(device) = pcm_entry
                .file_name()
                .to_str()
                .and_then(|n| numbered(n, "pcm", "c"))
            else {
                continue;
            };
            let Ok(subs) = fs::read_dir(pcm_entry.path()) else {
                continue;
            };
            for sub_entry in subs.flatten() {
                let Some(subdevice) = sub_entry
                    .file_name()
                    .to_str()
                    .and_then(|n| numbered(n, "sub", ""))
                else {
                    continue;
                };
                if let Some(cfg) =
                    read_capture_substream(card as i32, device, subdevice, &sub_entry.path())
                {
                    active.push(cfg);
                }
            }
        }
    }
    Ok(active)
}
