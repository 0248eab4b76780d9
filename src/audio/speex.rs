//! Safe wrappers around SpeexDSP's preprocessor (denoise) and echo canceller.

use std::ffi::{c_int, c_void};

// ======================== FFI declarations ========================

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

/// Opaque type for SpeexEchoState
#[repr(C)]
pub struct SpeexEchoState {
    _private: [u8; 0],
}

// Preprocessor request constants
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;
const SPEEX_PREPROCESS_SET_ECHO_STATE: c_int = 24;

// Echo canceller request constants
const SPEEX_ECHO_SET_SAMPLING_RATE: c_int = 24;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_echo_state_init(frame_size: c_int, filter_length: c_int) -> *mut SpeexEchoState;
    fn speex_echo_state_destroy(st: *mut SpeexEchoState);
    fn speex_echo_capture(st: *mut SpeexEchoState, rec: *const i16, out: *mut i16);
    fn speex_echo_playback(st: *mut SpeexEchoState, play: *const i16);
    fn speex_echo_state_reset(st: *mut SpeexEchoState);
    fn speex_echo_ctl(st: *mut SpeexEchoState, request: c_int, ptr: *mut c_void) -> c_int;
}

// ======================== Preprocessor (denoise) ========================

/// Safe wrapper around SpeexPreprocessState for noise suppression.
pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
}

// SpeexPreprocessState is used behind a mutex only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Create a new preprocessor for a given frame size (in samples) and sample rate.
    pub fn new(frame_size: usize, sample_rate: u32) -> anyhow::Result<Self> {
        let state = unsafe {
            speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int)
        };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        Ok(Self { state, frame_size })
    }

    /// Enable or disable denoising.
    pub fn set_denoise(&mut self, enable: bool) {
        let mut val: c_int = if enable { 1 } else { 0 };
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_DENOISE,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Set noise suppress level in dB (negative value, e.g. -25).
    pub fn set_noise_suppress(&mut self, level: i32) {
        let mut val: c_int = level;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_NOISE_SUPPRESS,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Link an echo canceller for residual echo suppression, or unlink with `None`.
    pub fn set_echo_state(&mut self, echo: Option<&EchoCanceller>) {
        let ptr = echo.map_or(std::ptr::null_mut(), |e| e.state);
        unsafe {
            speex_preprocess_ctl(self.state, SPEEX_PREPROCESS_SET_ECHO_STATE, ptr as *mut c_void);
        }
    }

    /// Run the preprocessor on one frame of 16-bit PCM mono samples in place.
    /// Frames of the wrong length are left untouched.
    pub fn process(&mut self, samples: &mut [i16]) {
        if samples.len() != self.frame_size {
            return;
        }
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Echo canceller ========================

/// Safe wrapper around SpeexEchoState.
///
/// Far-end (rendered) frames go in through `playback`, near-end (captured)
/// frames through `capture`; the canceller aligns the two internally.
pub struct EchoCanceller {
    state: *mut SpeexEchoState,
    frame_size: usize,
    scratch: Vec<i16>,
}

unsafe impl Send for EchoCanceller {}

impl EchoCanceller {
    /// * `frame_size`  - Samples per frame (one 10 ms mono block)
    /// * `tail_ms`     - Length of echo tail to model
    pub fn new(frame_size: usize, sample_rate: u32, tail_ms: u32) -> anyhow::Result<Self> {
        let filter_length = (sample_rate as usize * tail_ms as usize / 1000) as c_int;
        let state = unsafe { speex_echo_state_init(frame_size as c_int, filter_length) };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex echo canceller");
        }
        let mut rate: c_int = sample_rate as c_int;
        unsafe {
            speex_echo_ctl(
                state,
                SPEEX_ECHO_SET_SAMPLING_RATE,
                &mut rate as *mut c_int as *mut c_void,
            );
        }
        Ok(Self {
            state,
            frame_size,
            scratch: vec![0; frame_size],
        })
    }

    /// Feed one rendered frame.
    pub fn playback(&mut self, far_end: &[i16]) {
        if far_end.len() != self.frame_size {
            return;
        }
        unsafe {
            speex_echo_playback(self.state, far_end.as_ptr());
        }
    }

    /// Remove echo from one captured frame in place.
    pub fn capture(&mut self, near_end: &mut [i16]) {
        if near_end.len() != self.frame_size {
            return;
        }
        unsafe {
            speex_echo_capture(self.state, near_end.as_ptr(), self.scratch.as_mut_ptr());
        }
        near_end.copy_from_slice(&self.scratch);
    }

    pub fn reset(&mut self) {
        unsafe {
            speex_echo_state_reset(self.state);
        }
    }
}

impl Drop for EchoCanceller {
    fn drop(&mut self) {
        unsafe {
            speex_echo_state_destroy(self.state);
        }
    }
}
