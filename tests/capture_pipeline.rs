mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pcm_bridge::audio::effects::EffectKind;
use pcm_bridge::audio::{
    AudioContext, CapturePipeline, PipelineState, SessionMatch, StreamEvent, StreamKind,
};
use pcm_bridge::audio::device::RecordingConfig;
use pcm_bridge::audio::format::SampleFormat;
use pcm_bridge::{AudioError, StartErrorCode};

use support::{
    test_config, wait_until, EventLog, FakeEffectsPlatform, MockBackend, MockPlatform,
    RecordingSink, StartBehaviour,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    ctx: Arc<AudioContext>,
    backend: Arc<MockBackend>,
    effects: Arc<FakeEffectsPlatform>,
    sink: Arc<RecordingSink>,
    events: Arc<EventLog>,
    pipeline: CapturePipeline,
}

fn harness_with(platform: MockPlatform, effects: Arc<FakeEffectsPlatform>) -> Harness {
    let ctx = AudioContext::new().unwrap();
    let backend = MockBackend::new(platform);
    let sink = Arc::new(RecordingSink::default());
    let events = Arc::new(EventLog::default());
    let pipeline = CapturePipeline::new(
        ctx.clone(),
        backend.clone(),
        effects.clone(),
        sink.clone(),
        events.with_samples(),
        test_config(),
    );
    Harness {
        ctx,
        backend,
        effects,
        sink,
        events,
        pipeline,
    }
}

fn harness(platform: MockPlatform) -> Harness {
    harness_with(
        platform,
        FakeEffectsPlatform::with_kinds(&[EffectKind::Aec, EffectKind::Ns]),
    )
}

#[test]
fn init_reports_one_10ms_block() {
    let mut h = harness(MockPlatform::default());
    assert_eq!(h.pipeline.init(48000, 1).unwrap(), 480);
    assert_eq!(h.sink.cached_capacity.load(Ordering::SeqCst), 960);
    assert_eq!(h.pipeline.state(), PipelineState::Initialized);
    assert!(h.pipeline.stop());
}

#[test]
fn device_buffer_is_scaled_minimum_but_never_below_one_block() {
    let mut h = harness(MockPlatform {
        min_record_bytes: Some(4000),
        ..Default::default()
    });
    h.pipeline.init(48000, 1).unwrap();
    assert_eq!(h.backend.last_record().params.buffer_size_bytes, 8000);
    h.pipeline.stop();

    h.backend.platform.lock().unwrap().min_record_bytes = Some(100);
    h.pipeline.init(48000, 2).unwrap();
    assert_eq!(h.backend.last_record().params.buffer_size_bytes, 1920);
    h.pipeline.stop();
}

#[test]
fn captured_blocks_reach_sink_and_observer() {
    let mut h = harness(MockPlatform::default());
    h.pipeline.init(16000, 1).unwrap();
    h.pipeline.start().unwrap();
    assert!(wait_until(WAIT, || h.sink.frame_count() >= 5));
    assert!(h.pipeline.stop());

    let frames = h.sink.frames.lock().unwrap().clone();
    assert!(frames.iter().all(|(frame, _)| frame.len() == 320));
    assert!(frames.iter().all(|(frame, _)| frame.iter().any(|&b| b != 0)));
    assert!(frames.iter().all(|(_, ts)| *ts > 0));

    let samples = h.events.samples.lock().unwrap();
    assert!(!samples.is_empty());
    assert_eq!(samples[0].sample_rate, 16000);
    assert_eq!(samples[0].channels, 1);
    assert_eq!(samples[0].format, SampleFormat::S16Le);
    assert_eq!(samples[0].data.len(), 320);

    assert_eq!(
        h.events.states(),
        vec![
            (StreamKind::Capture, StreamEvent::Started),
            (StreamKind::Capture, StreamEvent::Stopped)
        ]
    );
    assert_eq!(h.backend.last_record().stops.load(Ordering::SeqCst), 1);
}

#[test]
fn microphone_mute_zeroes_blocks_without_changing_length() {
    let mut h = harness(MockPlatform::default());
    h.pipeline.init(48000, 1).unwrap();
    h.pipeline.start().unwrap();
    assert!(wait_until(WAIT, || h.sink.frame_count() >= 3));

    h.ctx.set_microphone_mute(true);
    let muted_from = h.sink.frame_count() + 1;
    assert!(wait_until(WAIT, || h.sink.frame_count() >= muted_from + 5));

    h.ctx.set_microphone_mute(false);
    let unmuted_from = h.sink.frame_count() + 1;
    assert!(wait_until(WAIT, || h.sink.frame_count() >= unmuted_from + 5));
    h.pipeline.stop();

    let frames = h.sink.frames.lock().unwrap();
    for (frame, _) in &frames[muted_from..muted_from + 4] {
        assert_eq!(frame.len(), 960);
        assert!(frame.iter().all(|&b| b == 0));
    }
    for (frame, _) in &frames[unmuted_from..unmuted_from + 4] {
        assert_eq!(frame.len(), 960);
        assert!(frame.iter().any(|&b| b != 0));
    }
}

#[test]
fn stop_is_idempotent() {
    let mut h = harness(MockPlatform::default());
    assert!(!h.pipeline.stop());

    h.pipeline.init(48000, 1).unwrap();
    assert!(h.pipeline.stop());
    assert!(!h.pipeline.stop());

    h.pipeline.init(48000, 1).unwrap();
    h.pipeline.start().unwrap();
    assert!(h.pipeline.stop());
    assert!(!h.pipeline.stop());
    assert_eq!(h.pipeline.state(), PipelineState::Idle);
}

#[test]
#[should_panic(expected = "requires init()")]
fn double_start_panics() {
    let mut h = harness(MockPlatform::default());
    h.pipeline.init(48000, 1).unwrap();
    h.pipeline.start().unwrap();
    let _ = h.pipeline.start();
}

#[test]
#[should_panic(expected = "requires init()")]
fn start_without_init_panics() {
    let mut h = harness(MockPlatform::default());
    let _ = h.pipeline.start();
}

#[test]
fn second_init_without_stop_is_an_init_error() {
    let mut h = harness(MockPlatform::default());
    h.pipeline.init(48000, 1).unwrap();
    assert!(matches!(h.pipeline.init(48000, 1), Err(AudioError::Init(_))));
    assert_eq!(h.pipeline.state(), PipelineState::Initialized);
    assert_eq!(h.events.errors().len(), 1);
    h.pipeline.stop();
}

#[test]
fn init_failures_leave_pipeline_idle() {
    let mut h = harness(MockPlatform {
        min_record_bytes: None,
        ..Default::default()
    });
    assert!(matches!(h.pipeline.init(48000, 1), Err(AudioError::Init(_))));
    assert_eq!(h.pipeline.state(), PipelineState::Idle);

    *h.backend.platform.lock().unwrap() = MockPlatform {
        fail_record_open: true,
        ..Default::default()
    };
    assert!(matches!(h.pipeline.init(48000, 1), Err(AudioError::Init(_))));
    assert!(matches!(h.pipeline.init(48000, 3), Err(AudioError::Init(_))));
    assert_eq!(h.pipeline.state(), PipelineState::Idle);

    let errors = h.events.errors();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|(kind, _)| *kind == StreamKind::Capture));
    // the engine only hears about a block once a device backs it
    assert_eq!(h.sink.cached_capacity.load(Ordering::SeqCst), 0);
}

#[test]
fn start_exception_releases_the_device() {
    let mut h = harness(MockPlatform {
        record_start: StartBehaviour::Fail,
        ..Default::default()
    });
    h.pipeline.init(48000, 1).unwrap();
    let err = h.pipeline.start().unwrap_err();
    assert!(matches!(
        err,
        AudioError::Start {
            code: StartErrorCode::Exception,
            ..
        }
    ));
    assert_eq!(h.pipeline.state(), PipelineState::Idle);
    assert_eq!(Arc::strong_count(&h.backend.last_record()), 2);
    assert_eq!(h.effects.created.lock().unwrap().len(), 0);
    assert_eq!(h.events.errors(), vec![(StreamKind::Capture, err)]);

    // a fresh init is allowed after a failed start
    h.backend.platform.lock().unwrap().record_start = StartBehaviour::Ok;
    h.pipeline.init(48000, 1).unwrap();
    h.pipeline.start().unwrap();
    assert!(h.pipeline.stop());
}

#[test]
fn start_state_mismatch_stops_and_releases_the_device() {
    let mut h = harness(MockPlatform {
        record_start: StartBehaviour::WrongState,
        ..Default::default()
    });
    h.pipeline.init(48000, 1).unwrap();
    assert!(matches!(
        h.pipeline.start(),
        Err(AudioError::Start {
            code: StartErrorCode::StateMismatch,
            ..
        })
    ));
    let device = h.backend.last_record();
    assert_eq!(device.stops.load(Ordering::SeqCst), 1);
    assert_eq!(Arc::strong_count(&device), 2);
    assert!(!h.pipeline.stop());
}

#[test]
fn fatal_read_ends_the_loop_with_a_runtime_error() {
    let mut h = harness(MockPlatform {
        record_fail_after_reads: Some(3),
        ..Default::default()
    });
    h.pipeline.init(48000, 1).unwrap();
    h.pipeline.start().unwrap();
    assert!(wait_until(WAIT, || h
        .events
        .states()
        .contains(&(StreamKind::Capture, StreamEvent::Stopped))));

    assert_eq!(h.sink.frame_count(), 3);
    let errors = h.events.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], (StreamKind::Capture, AudioError::Runtime(_))));
    assert!(h.pipeline.stop());
}

#[test]
fn effects_follow_the_session_and_skip_unsupported_aec() {
    let mut h = harness_with(
        MockPlatform::default(),
        FakeEffectsPlatform::with_kinds(&[EffectKind::Ns]),
    );
    assert!(!h.pipeline.is_aec_supported());
    assert!(!h.pipeline.request_aec(true));
    assert!(h.pipeline.request_ns(true));

    h.pipeline.init(48000, 1).unwrap();
    h.pipeline.start().unwrap();
    let session = h.pipeline.session_id().unwrap();
    assert_eq!(
        *h.effects.created.lock().unwrap(),
        vec![(EffectKind::Ns, session)]
    );
    assert_eq!(h.effects.live.load(Ordering::SeqCst), 1);

    h.pipeline.stop();
    assert_eq!(h.effects.live.load(Ordering::SeqCst), 0);
}

#[test]
fn session_verification_reports_match_and_mismatch() {
    let mut h = harness(MockPlatform::default());
    h.pipeline.init(48000, 1).unwrap();
    assert_eq!(h.pipeline.is_session_matching(), SessionMatch::Unknown);

    let active = RecordingConfig {
        source: None,
        session_id: h.pipeline.session_id(),
        sample_rate: 48000,
        channels: 1,
        format: SampleFormat::S16Le,
        location: Some((0, 0, 0)),
        owner_pid: Some(std::process::id()),
    };
    h.backend.platform.lock().unwrap().active_recordings = Some(vec![active]);
    h.pipeline.start().unwrap();
    assert!(wait_until(WAIT, || h.pipeline.is_session_matching()
        == SessionMatch::Matching));
    h.pipeline.stop();

    h.backend.platform.lock().unwrap().active_recordings = Some(Vec::new());
    h.pipeline.init(48000, 1).unwrap();
    h.pipeline.start().unwrap();
    assert!(wait_until(WAIT, || h.pipeline.is_session_matching()
        == SessionMatch::Mismatch));
    h.pipeline.stop();
}

#[test]
fn preferred_device_is_used_at_open_and_forwarded_while_running() {
    let mut h = harness(MockPlatform::default());
    h.pipeline.set_preferred_device(Some("usb-headset".into()));
    h.pipeline.init(48000, 1).unwrap();
    let device = h.backend.last_record();
    assert_eq!(device.params.preferred_device.as_deref(), Some("usb-headset"));

    h.pipeline.start().unwrap();
    h.pipeline.set_preferred_device(None);
    assert_eq!(*device.preferred.lock().unwrap(), None);
    h.pipeline.stop();
}

#[test]
fn calls_from_a_foreign_thread_panic_until_rebound() {
    let mut h = harness(MockPlatform::default());
    assert!(!h.pipeline.stop());

    let mut pipeline = h.pipeline;
    let outcome = std::thread::spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pipeline.stop();
        }));
        (result.is_err(), pipeline)
    })
    .join()
    .unwrap();
    let (panicked, pipeline) = outcome;
    assert!(panicked);

    pipeline.thread_checker().detach();
    let handed_over = std::thread::spawn(move || {
        let mut pipeline = pipeline;
        pipeline.thread_checker().bind_to(std::thread::current().id());
        pipeline.init(48000, 1).map(|_| pipeline.stop())
    })
    .join()
    .unwrap();
    assert_eq!(handed_over, Ok(true));
}
