//! In-memory platform for pipeline tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pcm_bridge::audio::callbacks::{AudioSamples, Callbacks, CaptureSink, PlayoutSource};
use pcm_bridge::audio::device::{
    AudioBackend, BufferSizeControl, DeviceSnapshot, DeviceState, PlayState, PlaybackDevice,
    PlaybackParams, RecordDevice, RecordParams, RecordingConfig, RecordingState, SessionId,
};
use pcm_bridge::audio::effects::{EffectDescriptor, EffectKind, EffectsPlatform, PlatformEffect};
use pcm_bridge::audio::{AudioConfig, StreamEvent, StreamKind};
use pcm_bridge::{AudioError, DeviceError};

/// Pace of the fake devices, well below a real 10 ms block.
const IO_PACE: Duration = Duration::from_millis(1);

pub fn test_config() -> AudioConfig {
    AudioConfig {
        verify_delay: Duration::from_millis(10),
        stats_interval: Duration::from_millis(50),
        join_timeout: Duration::from_millis(2000),
        ..AudioConfig::default()
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehaviour {
    Ok,
    Fail,
    WrongState,
}

// ======================== Record device ========================

pub struct MockRecordDevice {
    pub session_id: SessionId,
    pub params: RecordParams,
    start_behaviour: StartBehaviour,
    fail_after_reads: Option<usize>,
    recording: AtomicBool,
    pub reads: AtomicUsize,
    pub stops: AtomicUsize,
    pub preferred: Mutex<Option<String>>,
}

impl RecordDevice for MockRecordDevice {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn state(&self) -> DeviceState {
        DeviceState::Initialized
    }

    fn start(&self) -> Result<(), DeviceError> {
        match self.start_behaviour {
            StartBehaviour::Ok => {
                self.recording.store(true, Ordering::SeqCst);
                Ok(())
            }
            StartBehaviour::Fail => Err(DeviceError::InvalidState("mock start failure".into())),
            StartBehaviour::WrongState => Ok(()),
        }
    }

    fn recording_state(&self) -> RecordingState {
        if self.recording.load(Ordering::SeqCst) {
            RecordingState::Recording
        } else {
            RecordingState::Stopped
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        thread::sleep(IO_PACE);
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_after_reads.is_some_and(|limit| n > limit) {
            return Err(DeviceError::InvalidOperation("mock device died".into()));
        }
        // never silent, so zeroed blocks can only come from muting
        buf.fill((n % 200) as u8 + 1);
        Ok(buf.len())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.recording.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn timestamp_ns(&self) -> Option<i64> {
        Some(self.reads.load(Ordering::SeqCst) as i64 * 10_000_000)
    }

    fn set_preferred_device(&self, device: Option<&str>) -> bool {
        *self.preferred.lock().unwrap() = device.map(str::to_string);
        true
    }

    fn recording_config(&self) -> RecordingConfig {
        RecordingConfig {
            source: Some(self.params.source),
            session_id: Some(self.session_id),
            sample_rate: self.params.config.sample_rate,
            channels: self.params.config.channels,
            format: self.params.config.format,
            location: None,
            owner_pid: Some(std::process::id()),
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            name: "mock-capture".into(),
            session_id: self.session_id,
            state: DeviceState::Initialized,
            running: self.recording.load(Ordering::SeqCst),
            sample_rate: self.params.config.sample_rate,
            channels: self.params.config.channels,
            buffer_size_in_frames: self.params.buffer_size_bytes / self.params.config.bytes_per_frame(),
            underrun_count: None,
        }
    }
}

// ======================== Playback device ========================

pub struct MockPlaybackDevice {
    pub session_id: SessionId,
    pub params: PlaybackParams,
    start_behaviour: StartBehaviour,
    underrun_on_writes: Vec<usize>,
    short_write_on: Option<usize>,
    counts_underruns: bool,
    capacity_frames: usize,
    playing: AtomicBool,
    buffer_frames: AtomicUsize,
    underruns: AtomicU32,
    pub writes: AtomicUsize,
    pub silent_writes: AtomicUsize,
    pub stops: AtomicUsize,
    /// Every size passed to `set_buffer_size_in_frames`, after clamping.
    pub size_history: Mutex<Vec<usize>>,
}

impl BufferSizeControl for MockPlaybackDevice {
    fn underrun_count(&self) -> Option<u32> {
        self.counts_underruns
            .then(|| self.underruns.load(Ordering::SeqCst))
    }

    fn buffer_size_in_frames(&self) -> usize {
        self.buffer_frames.load(Ordering::SeqCst)
    }

    fn set_buffer_size_in_frames(&self, frames: usize) -> usize {
        let applied = frames.min(self.capacity_frames);
        self.buffer_frames.store(applied, Ordering::SeqCst);
        self.size_history.lock().unwrap().push(applied);
        applied
    }

    fn playback_rate(&self) -> u32 {
        self.params.config.sample_rate
    }
}

impl PlaybackDevice for MockPlaybackDevice {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn state(&self) -> DeviceState {
        DeviceState::Initialized
    }

    fn start(&self) -> Result<(), DeviceError> {
        match self.start_behaviour {
            StartBehaviour::Ok => {
                self.playing.store(true, Ordering::SeqCst);
                Ok(())
            }
            StartBehaviour::Fail => Err(DeviceError::InvalidState("mock start failure".into())),
            StartBehaviour::WrongState => Ok(()),
        }
    }

    fn play_state(&self) -> PlayState {
        if self.playing.load(Ordering::SeqCst) {
            PlayState::Playing
        } else {
            PlayState::Stopped
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, DeviceError> {
        thread::sleep(IO_PACE);
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if buf.iter().all(|&b| b == 0) {
            self.silent_writes.fetch_add(1, Ordering::SeqCst);
        }
        if self.underrun_on_writes.contains(&n) {
            self.underruns.fetch_add(1, Ordering::SeqCst);
        }
        if self.short_write_on == Some(n) {
            return Ok(buf.len() / 2);
        }
        Ok(buf.len())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.playing.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn buffer_capacity_in_frames(&self) -> usize {
        self.capacity_frames
    }

    fn set_preferred_device(&self, _device: Option<&str>) -> bool {
        false
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            name: "mock-playback".into(),
            session_id: self.session_id,
            state: DeviceState::Initialized,
            running: self.playing.load(Ordering::SeqCst),
            sample_rate: self.params.config.sample_rate,
            channels: self.params.config.channels,
            buffer_size_in_frames: self.buffer_frames.load(Ordering::SeqCst),
            underrun_count: self.underrun_count(),
        }
    }
}

// ======================== Backend ========================

/// Scripted platform behaviour. Byte sizes are for the requested format.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    pub min_record_bytes: Option<usize>,
    pub min_playback_bytes: Option<usize>,
    pub low_latency_frames: Option<usize>,
    pub native_rate: Option<u32>,
    pub fail_record_open: bool,
    pub record_start: StartBehaviour,
    pub playback_start: StartBehaviour,
    pub record_fail_after_reads: Option<usize>,
    pub underrun_on_writes: Vec<usize>,
    pub short_write_on: Option<usize>,
    pub counts_underruns: bool,
    pub playback_capacity_frames: usize,
    pub active_recordings: Option<Vec<RecordingConfig>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            min_record_bytes: Some(3840),
            min_playback_bytes: Some(9600),
            low_latency_frames: Some(480),
            native_rate: None,
            fail_record_open: false,
            record_start: StartBehaviour::Ok,
            playback_start: StartBehaviour::Ok,
            record_fail_after_reads: None,
            underrun_on_writes: Vec::new(),
            short_write_on: None,
            counts_underruns: true,
            playback_capacity_frames: 48000,
            active_recordings: Some(Vec::new()),
        }
    }
}

pub struct MockBackend {
    pub platform: Mutex<MockPlatform>,
    next_session: AtomicU32,
    pub records: Mutex<Vec<Arc<MockRecordDevice>>>,
    pub playbacks: Mutex<Vec<Arc<MockPlaybackDevice>>>,
}

impl MockBackend {
    pub fn new(platform: MockPlatform) -> Arc<Self> {
        Arc::new(Self {
            platform: Mutex::new(platform),
            next_session: AtomicU32::new(100),
            records: Mutex::new(Vec::new()),
            playbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn last_record(&self) -> Arc<MockRecordDevice> {
        self.records.lock().unwrap().last().cloned().expect("no capture device opened")
    }

    pub fn last_playback(&self) -> Arc<MockPlaybackDevice> {
        self.playbacks.lock().unwrap().last().cloned().expect("no playback device opened")
    }

    fn platform(&self) -> MockPlatform {
        self.platform.lock().unwrap().clone()
    }
}

impl AudioBackend for MockBackend {
    fn min_record_buffer_bytes(&self, _sample_rate: u32, _channels: u16) -> Result<usize, DeviceError> {
        self.platform()
            .min_record_bytes
            .ok_or_else(|| DeviceError::Unsupported("no record minimum".into()))
    }

    fn min_playback_buffer_bytes(
        &self,
        _sample_rate: u32,
        _channels: u16,
    ) -> Result<usize, DeviceError> {
        self.platform()
            .min_playback_bytes
            .ok_or_else(|| DeviceError::Unsupported("no playback minimum".into()))
    }

    fn low_latency_output_frames(&self, _sample_rate: u32) -> Option<usize> {
        self.platform().low_latency_frames
    }

    fn low_latency_input_frames(&self, _sample_rate: u32) -> Option<usize> {
        self.platform().low_latency_frames
    }

    fn native_output_sample_rate(&self) -> Option<u32> {
        self.platform().native_rate
    }

    fn open_record(&self, params: &RecordParams) -> Result<Arc<dyn RecordDevice>, DeviceError> {
        let platform = self.platform();
        if platform.fail_record_open {
            return Err(DeviceError::Creation("mock open failure".into()));
        }
        let device = Arc::new(MockRecordDevice {
            session_id: self.next_session.fetch_add(1, Ordering::SeqCst),
            params: params.clone(),
            start_behaviour: platform.record_start,
            fail_after_reads: platform.record_fail_after_reads,
            recording: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            preferred: Mutex::new(params.preferred_device.clone()),
        });
        self.records.lock().unwrap().push(device.clone());
        Ok(device)
    }

    fn open_playback(
        &self,
        params: &PlaybackParams,
    ) -> Result<Arc<dyn PlaybackDevice>, DeviceError> {
        let platform = self.platform();
        let initial = params.buffer_size_bytes / params.config.bytes_per_frame();
        let device = Arc::new(MockPlaybackDevice {
            session_id: self.next_session.fetch_add(1, Ordering::SeqCst),
            params: params.clone(),
            start_behaviour: platform.playback_start,
            underrun_on_writes: platform.underrun_on_writes.clone(),
            short_write_on: platform.short_write_on,
            counts_underruns: platform.counts_underruns,
            capacity_frames: platform.playback_capacity_frames,
            playing: AtomicBool::new(false),
            buffer_frames: AtomicUsize::new(initial),
            underruns: AtomicU32::new(0),
            writes: AtomicUsize::new(0),
            silent_writes: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            size_history: Mutex::new(Vec::new()),
        });
        self.playbacks.lock().unwrap().push(device.clone());
        Ok(device)
    }

    fn active_recording_configs(&self) -> Result<Vec<RecordingConfig>, DeviceError> {
        self.platform()
            .active_recordings
            .ok_or_else(|| DeviceError::Unsupported("no recording list".into()))
    }
}

// ======================== Effects ========================

pub struct FakeEffect {
    enabled: bool,
    live: Arc<AtomicUsize>,
}

impl PlatformEffect for FakeEffect {
    fn set_enabled(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.enabled = enabled;
        Ok(())
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for FakeEffect {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeEffectsPlatform {
    pub descriptors: Vec<EffectDescriptor>,
    pub created: Mutex<Vec<(EffectKind, SessionId)>>,
    pub live: Arc<AtomicUsize>,
}

impl FakeEffectsPlatform {
    pub fn with_kinds(kinds: &[EffectKind]) -> Arc<Self> {
        let descriptors = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| EffectDescriptor {
                type_uuid: kind.type_uuid(),
                implementation_uuid: uuid::Uuid::from_u128(0xfeed_0000 + i as u128),
                name: format!("fake {:?}", kind),
            })
            .collect();
        Arc::new(Self {
            descriptors,
            ..Default::default()
        })
    }
}

impl EffectsPlatform for FakeEffectsPlatform {
    fn descriptors(&self) -> Vec<EffectDescriptor> {
        self.descriptors.clone()
    }

    fn create(
        &self,
        kind: EffectKind,
        session_id: SessionId,
    ) -> Result<Box<dyn PlatformEffect>, DeviceError> {
        self.created.lock().unwrap().push((kind, session_id));
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEffect {
            enabled: false,
            live: self.live.clone(),
        }))
    }
}

// ======================== Engine side ========================

#[derive(Default)]
pub struct RecordingSink {
    pub cached_capacity: AtomicUsize,
    pub frames: Mutex<Vec<(Vec<u8>, i64)>>,
}

impl RecordingSink {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl CaptureSink for RecordingSink {
    fn on_buffer_cached(&self, capacity: usize) {
        self.cached_capacity.store(capacity, Ordering::SeqCst);
    }

    fn on_frame_captured(&self, frame: &[u8], capture_timestamp_ns: i64) {
        self.frames
            .lock()
            .unwrap()
            .push((frame.to_vec(), capture_timestamp_ns));
    }
}

/// Fills every requested block with a constant non-zero pattern.
#[derive(Default)]
pub struct PatternSource {
    pub cached_capacity: AtomicUsize,
    pub requests: AtomicUsize,
}

impl PlayoutSource for PatternSource {
    fn on_buffer_cached(&self, capacity: usize) {
        self.cached_capacity.store(capacity, Ordering::SeqCst);
    }

    fn on_frame_requested(&self, frame: &mut [u8]) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        frame.fill(0x55);
    }
}

/// Everything the host callbacks saw.
#[derive(Default)]
pub struct EventLog {
    pub errors: Mutex<Vec<(StreamKind, AudioError)>>,
    pub states: Mutex<Vec<(StreamKind, StreamEvent)>>,
    pub samples: Mutex<Vec<AudioSamples>>,
}

impl EventLog {
    pub fn callbacks(self: &Arc<Self>) -> Callbacks {
        let errors = self.clone();
        let states = self.clone();
        Callbacks::default()
            .with_error(Arc::new(move |kind: StreamKind, err: &AudioError| {
                errors.errors.lock().unwrap().push((kind, err.clone()));
            }))
            .with_state(Arc::new(move |kind: StreamKind, event: StreamEvent| {
                states.states.lock().unwrap().push((kind, event));
            }))
    }

    pub fn with_samples(self: &Arc<Self>) -> Callbacks {
        let samples = self.clone();
        self.callbacks().with_samples(Arc::new(move |s: AudioSamples| {
            samples.samples.lock().unwrap().push(s);
        }))
    }

    pub fn errors(&self) -> Vec<(StreamKind, AudioError)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<(StreamKind, StreamEvent)> {
        self.states.lock().unwrap().clone()
    }
}
