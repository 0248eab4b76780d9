//! Process-wide audio state shared by both pipelines.
//!
//! Create one `AudioContext` per process before initializing any pipeline and
//! keep it alive until both pipelines are stopped; dropping the last reference
//! shuts down the diagnostics runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;

use super::diagnostics::DiagnosticsScheduler;
use super::effects::{EffectDescriptor, EffectsPlatform};

pub struct AudioContext {
    speaker_mute: AtomicBool,
    microphone_mute: AtomicBool,
    effect_descriptors: OnceLock<Vec<EffectDescriptor>>,
    scheduler: DiagnosticsScheduler,
}

impl AudioContext {
    pub fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            speaker_mute: AtomicBool::new(false),
            microphone_mute: AtomicBool::new(false),
            effect_descriptors: OnceLock::new(),
            scheduler: DiagnosticsScheduler::new()?,
        }))
    }

    /// Takes effect on the next playout block.
    pub fn set_speaker_mute(&self, mute: bool) {
        log::warn!("set_speaker_mute({})", mute);
        self.speaker_mute.store(mute, Ordering::Relaxed);
    }

    /// Takes effect on the next captured block.
    pub fn set_microphone_mute(&self, mute: bool) {
        log::warn!("set_microphone_mute({})", mute);
        self.microphone_mute.store(mute, Ordering::Relaxed);
    }

    pub fn speaker_muted(&self) -> bool {
        self.speaker_mute.load(Ordering::Relaxed)
    }

    pub fn microphone_muted(&self) -> bool {
        self.microphone_mute.load(Ordering::Relaxed)
    }

    /// Platform effect descriptors, queried once per process.
    pub fn effect_descriptors(&self, platform: &dyn EffectsPlatform) -> &[EffectDescriptor] {
        self.effect_descriptors.get_or_init(|| {
            let descriptors = platform.descriptors();
            for d in &descriptors {
                log::debug!(
                    "Effect {}: type={} implementation={}",
                    d.name,
                    d.type_uuid,
                    d.implementation_uuid
                );
            }
            descriptors
        })
    }

    pub fn scheduler(&self) -> &DiagnosticsScheduler {
        &self.scheduler
    }
}
