//! SpeexDSP-backed effects for ALSA sessions.
//!
//! ALSA has no effect framework, so effects live in a registry keyed by
//! session id. The record device runs its session's enabled effects on every
//! captured block; the playback device feeds rendered blocks in as the echo
//! reference. Effects are only offered for mono sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::device::SessionId;
use super::effects::{EffectDescriptor, EffectKind, EffectsPlatform, PlatformEffect};
use super::format::{bytes_to_samples, samples_to_bytes, BUFFERS_PER_SECOND};
use super::speex::{EchoCanceller, Preprocessor};
use crate::error::DeviceError;

const SPEEX_AEC_UUID: Uuid = Uuid::from_u128(0x3f2b6a70_5d1e_4c8a_9b0e_6a1f2c3d4e51);
const SPEEX_NS_UUID: Uuid = Uuid::from_u128(0x3f2b6a70_5d1e_4c8a_9b0e_6a1f2c3d4e52);

const ECHO_TAIL_MS: u32 = 200;
const NOISE_SUPPRESS_DB: i32 = -25;

struct EchoSlot {
    canceller: EchoCanceller,
    enabled: bool,
}

struct DenoiseSlot {
    preprocessor: Preprocessor,
    enabled: bool,
}

struct SessionChain {
    sample_rate: u32,
    channels: u16,
    aec: Option<EchoSlot>,
    ns: Option<DenoiseSlot>,
    scratch: Vec<i16>,
}

impl SessionChain {
    fn frame_samples(&self) -> usize {
        (self.sample_rate / BUFFERS_PER_SECOND) as usize * self.channels as usize
    }

    fn has_enabled(&self) -> bool {
        self.aec.as_ref().is_some_and(|s| s.enabled) || self.ns.as_ref().is_some_and(|s| s.enabled)
    }

    /// Point the denoiser at the running echo canceller for residual echo suppression.
    fn link_echo_state(&mut self) {
        let echo = self.aec.as_ref().filter(|s| s.enabled).map(|s| &s.canceller);
        if let Some(ns) = self.ns.as_mut() {
            ns.preprocessor.set_echo_state(echo);
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionChain>,
    far_end: Vec<i16>,
}

#[derive(Default)]
pub struct SessionEffectRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionEffectRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_session(&self, session_id: SessionId, sample_rate: u32, channels: u16) {
        self.lock().sessions.insert(
            session_id,
            SessionChain {
                sample_rate,
                channels,
                aec: None,
                ns: None,
                scratch: Vec::new(),
            },
        );
    }

    pub fn unregister_session(&self, session_id: SessionId) {
        self.lock().sessions.remove(&session_id);
    }

    fn install(&self, kind: EffectKind, session_id: SessionId) -> Result<(), DeviceError> {
        let mut inner = self.lock();
        let chain = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| DeviceError::InvalidState(format!("unknown session {}", session_id)))?;
        if chain.channels != 1 {
            return Err(DeviceError::Unsupported(format!(
                "{:?} needs a mono session, session {} has {} channels",
                kind, session_id, chain.channels
            )));
        }
        let frame = chain.frame_samples();
        match kind {
            EffectKind::Aec => {
                let canceller = EchoCanceller::new(frame, chain.sample_rate, ECHO_TAIL_MS)
                    .map_err(|e| DeviceError::Creation(e.to_string()))?;
                chain.aec = Some(EchoSlot {
                    canceller,
                    enabled: false,
                });
            }
            EffectKind::Ns => {
                let mut preprocessor = Preprocessor::new(frame, chain.sample_rate)
                    .map_err(|e| DeviceError::Creation(e.to_string()))?;
                preprocessor.set_denoise(true);
                preprocessor.set_noise_suppress(NOISE_SUPPRESS_DB);
                chain.ns = Some(DenoiseSlot {
                    preprocessor,
                    enabled: false,
                });
            }
        }
        chain.link_echo_state();
        Ok(())
    }

    fn set_enabled(&self, kind: EffectKind, session_id: SessionId, enabled: bool) -> bool {
        let mut inner = self.lock();
        let Some(chain) = inner.sessions.get_mut(&session_id) else {
            return false;
        };
        let found = match kind {
            EffectKind::Aec => match chain.aec.as_mut() {
                Some(slot) => {
                    if enabled && !slot.enabled {
                        slot.canceller.reset();
                    }
                    slot.enabled = enabled;
                    true
                }
                None => false,
            },
            EffectKind::Ns => match chain.ns.as_mut() {
                Some(slot) => {
                    slot.enabled = enabled;
                    true
                }
                None => false,
            },
        };
        chain.link_echo_state();
        found
    }

    fn remove(&self, kind: EffectKind, session_id: SessionId) {
        let mut inner = self.lock();
        if let Some(chain) = inner.sessions.get_mut(&session_id) {
            match kind {
                EffectKind::Aec => {
                    // unlink before the echo state is destroyed
                    let aec = chain.aec.take();
                    chain.link_echo_state();
                    drop(aec);
                }
                EffectKind::Ns => chain.ns = None,
            }
        }
    }

    /// Run the session's enabled effects on one captured block in place.
    pub fn process_capture(&self, session_id: SessionId, block: &mut [u8]) {
        let mut inner = self.lock();
        let Some(chain) = inner.sessions.get_mut(&session_id) else {
            return;
        };
        if !chain.has_enabled() {
            return;
        }
        let mut samples = std::mem::take(&mut chain.scratch);
        bytes_to_samples(block, &mut samples);
        if samples.len() == chain.frame_samples() {
            if let Some(slot) = chain.aec.as_mut().filter(|s| s.enabled) {
                slot.canceller.capture(&mut samples);
            }
            if let Some(slot) = chain.ns.as_mut().filter(|s| s.enabled) {
                slot.preprocessor.process(&mut samples);
            }
            samples_to_bytes(&samples, block);
        }
        chain.scratch = samples;
    }

    /// Offer one rendered block as echo reference to every matching session.
    pub fn feed_far_end(&self, sample_rate: u32, channels: u16, block: &[u8]) {
        let mut inner = self.lock();
        let RegistryInner { sessions, far_end } = &mut *inner;
        let mut converted = false;
        for chain in sessions.values_mut() {
            let Some(slot) = chain.aec.as_mut().filter(|s| s.enabled) else {
                continue;
            };
            if chain.sample_rate != sample_rate || channels != 1 {
                continue;
            }
            if !converted {
                bytes_to_samples(block, far_end);
                converted = true;
            }
            slot.canceller.playback(&far_end[..]);
        }
    }

    pub fn has_enabled_effects(&self, session_id: SessionId) -> bool {
        self.lock()
            .sessions
            .get(&session_id)
            .is_some_and(SessionChain::has_enabled)
    }
}

/// Effects platform for ALSA sessions, backed by SpeexDSP.
pub struct SpeexEffectsPlatform {
    registry: Arc<SessionEffectRegistry>,
}

impl SpeexEffectsPlatform {
    pub fn new(registry: Arc<SessionEffectRegistry>) -> Self {
        Self { registry }
    }
}

impl EffectsPlatform for SpeexEffectsPlatform {
    fn descriptors(&self) -> Vec<EffectDescriptor> {
        vec![
            EffectDescriptor {
                type_uuid: EffectKind::Aec.type_uuid(),
                implementation_uuid: SPEEX_AEC_UUID,
                name: "SpeexDSP echo canceller".to_string(),
            },
            EffectDescriptor {
                type_uuid: EffectKind::Ns.type_uuid(),
                implementation_uuid: SPEEX_NS_UUID,
                name: "SpeexDSP noise suppressor".to_string(),
            },
        ]
    }

    fn create(
        &self,
        kind: EffectKind,
        session_id: SessionId,
    ) -> Result<Box<dyn PlatformEffect>, DeviceError> {
        self.registry.install(kind, session_id)?;
        Ok(Box::new(SpeexEffect {
            registry: self.registry.clone(),
            kind,
            session_id,
            enabled: false,
        }))
    }
}

struct SpeexEffect {
    registry: Arc<SessionEffectRegistry>,
    kind: EffectKind,
    session_id: SessionId,
    enabled: bool,
}

impl PlatformEffect for SpeexEffect {
    fn set_enabled(&mut self, enabled: bool) -> Result<(), DeviceError> {
        if !self.registry.set_enabled(self.kind, self.session_id, enabled) {
            return Err(DeviceError::InvalidState(format!(
                "{:?} for session {} is gone",
                self.kind, self.session_id
            )));
        }
        self.enabled = enabled;
        Ok(())
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for SpeexEffect {
    fn drop(&mut self) {
        self.registry.remove(self.kind, self.session_id);
    }
}
