use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use pcm_bridge::audio::{
    AudioConfig, AudioContext, AudioSystem, Callbacks, CaptureSink, PlayoutSource, StreamEvent,
    StreamKind,
};
use pcm_bridge::config::Config;
use pcm_bridge::AudioError;
use tokio::signal;
use tokio::sync::mpsc;

/// Blocks kept between capture and playout before the oldest is dropped.
const MAX_QUEUED_BLOCKS: usize = 10;

enum AudioEvent {
    Error(StreamKind, AudioError),
    State(StreamKind, StreamEvent),
}

/// Stand-in media engine: every captured block is played back.
struct LoopbackEngine {
    queue: Mutex<VecDeque<Bytes>>,
    max_queued: usize,
    dropped: AtomicU64,
    silent: AtomicU64,
}

impl LoopbackEngine {
    fn new(max_queued: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(max_queued)),
            max_queued,
            dropped: AtomicU64::new(0),
            silent: AtomicU64::new(0),
        }
    }
}

impl CaptureSink for LoopbackEngine {
    fn on_buffer_cached(&self, capacity: usize) {
        log::info!("Capture block size: {} bytes", capacity);
    }

    fn on_frame_captured(&self, frame: &[u8], _capture_timestamp_ns: i64) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.max_queued {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(Bytes::copy_from_slice(frame));
    }
}

impl PlayoutSource for LoopbackEngine {
    fn on_buffer_cached(&self, capacity: usize) {
        log::info!("Playout block size: {} bytes", capacity);
    }

    fn on_frame_requested(&self, frame: &mut [u8]) {
        let block = self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match block {
            Some(block) if block.len() == frame.len() => frame.copy_from_slice(&block),
            _ => {
                frame.fill(0);
                self.silent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().unwrap_or_default();
    log::info!("{} v{} starting", config.app_name, config.app_version);

    // 回调事件通道，回调在音频线程上执行，只做非阻塞发送
    let (tx_event, mut rx_event) = mpsc::unbounded_channel::<AudioEvent>();
    let callbacks = {
        let tx_error = tx_event.clone();
        let tx_state = tx_event;
        Callbacks::default()
            .with_error(Arc::new(move |kind: StreamKind, err: &AudioError| {
                let _ = tx_error.send(AudioEvent::Error(kind, err.clone()));
            }))
            .with_state(Arc::new(move |kind: StreamKind, event: StreamEvent| {
                let _ = tx_state.send(AudioEvent::State(kind, event));
            }))
    };

    let engine = Arc::new(LoopbackEngine::new(MAX_QUEUED_BLOCKS));
    let ctx = AudioContext::new()?;
    let mut audio = AudioSystem::with_alsa(
        ctx,
        AudioConfig::from(&config),
        engine.clone(),
        engine.clone(),
        callbacks,
    );
    let params = audio.start()?;
    log::info!(
        "Loopback running at {} Hz, {} ch (low latency out: {}, in: {})",
        params.sample_rate,
        params.channels,
        params.low_latency_output,
        params.low_latency_input
    );

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(event) = rx_event.recv() => {
                match event {
                    AudioEvent::Error(kind, AudioError::Runtime(message)) => {
                        log::error!("{:?} loop terminated: {}", kind, message);
                        break;
                    }
                    AudioEvent::Error(kind, err) => {
                        log::warn!("{:?}: {}", kind, err);
                    }
                    AudioEvent::State(kind, event) => {
                        log::info!("{:?} {:?}", kind, event);
                    }
                }
            }
        }
    }

    audio.stop();
    log::info!(
        "Loopback finished: {} blocks dropped, {} silent blocks played",
        engine.dropped.load(Ordering::Relaxed),
        engine.silent.load(Ordering::Relaxed)
    );
    Ok(())
}
