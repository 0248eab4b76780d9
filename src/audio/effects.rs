//! Platform acoustic echo cancellation (AEC) and noise suppression (NS).
//!
//! The host requests each effect before a session starts; the controller
//! attaches the platform effects to the recording session id when capture
//! starts and releases them when it stops.

use std::sync::Arc;

use uuid::Uuid;

use super::context::AudioContext;
use super::device::SessionId;
use crate::error::DeviceError;

/// Effect type ids as published by the platform effect framework.
pub const AEC_TYPE_UUID: Uuid = Uuid::from_u128(0x7b491460_8d4d_11e0_bd61_0002a5d5c51b);
pub const NS_TYPE_UUID: Uuid = Uuid::from_u128(0x58b4b260_8e06_11e0_aa8e_0002a5d5c51b);

/// Implementations that advertise themselves but are known not to work.
const BLOCKLISTED_IMPLEMENTATIONS: [Uuid; 2] = [
    // AOSP software AEC
    Uuid::from_u128(0xbb392ec0_8d4d_11e0_a896_0002a5d5c51b),
    // AOSP software NS
    Uuid::from_u128(0xc06c8400_8e06_11e0_9cb6_0002a5d5c51b),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Aec,
    Ns,
}

impl EffectKind {
    pub fn type_uuid(self) -> Uuid {
        match self {
            EffectKind::Aec => AEC_TYPE_UUID,
            EffectKind::Ns => NS_TYPE_UUID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectDescriptor {
    pub type_uuid: Uuid,
    pub implementation_uuid: Uuid,
    pub name: String,
}

/// A live effect instance bound to one session. Released on drop.
pub trait PlatformEffect: Send {
    fn set_enabled(&mut self, enabled: bool) -> Result<(), DeviceError>;
    fn enabled(&self) -> bool;
}

pub trait EffectsPlatform: Send + Sync {
    /// Every effect implementation the platform advertises.
    fn descriptors(&self) -> Vec<EffectDescriptor>;

    fn create(
        &self,
        kind: EffectKind,
        session_id: SessionId,
    ) -> Result<Box<dyn PlatformEffect>, DeviceError>;
}

pub fn is_blocklisted(implementation: &Uuid) -> bool {
    BLOCKLISTED_IMPLEMENTATIONS.contains(implementation)
}

/// True when some advertised, non-blocklisted implementation has the effect's type.
pub fn is_effect_supported(descriptors: &[EffectDescriptor], kind: EffectKind) -> bool {
    descriptors
        .iter()
        .any(|d| d.type_uuid == kind.type_uuid() && !is_blocklisted(&d.implementation_uuid))
}

pub struct EffectsController {
    ctx: Arc<AudioContext>,
    platform: Arc<dyn EffectsPlatform>,
    should_enable_aec: bool,
    should_enable_ns: bool,
    aec: Option<Box<dyn PlatformEffect>>,
    ns: Option<Box<dyn PlatformEffect>>,
}

impl EffectsController {
    pub fn new(ctx: Arc<AudioContext>, platform: Arc<dyn EffectsPlatform>) -> Self {
        Self {
            ctx,
            platform,
            should_enable_aec: false,
            should_enable_ns: false,
            aec: None,
            ns: None,
        }
    }

    pub fn is_aec_supported(&self) -> bool {
        is_effect_supported(self.ctx.effect_descriptors(&*self.platform), EffectKind::Aec)
    }

    pub fn is_ns_supported(&self) -> bool {
        is_effect_supported(self.ctx.effect_descriptors(&*self.platform), EffectKind::Ns)
    }

    pub fn request_aec(&mut self, enable: bool) -> bool {
        log::info!("request_aec({})", enable);
        if !self.is_aec_supported() {
            log::warn!("Platform AEC is not supported");
            self.should_enable_aec = false;
            return false;
        }
        if self.aec.is_some() && enable != self.should_enable_aec {
            log::error!("Platform AEC state can't be modified while recording");
            return false;
        }
        self.should_enable_aec = enable;
        true
    }

    pub fn request_ns(&mut self, enable: bool) -> bool {
        log::info!("request_ns({})", enable);
        if !self.is_ns_supported() {
            log::warn!("Platform NS is not supported");
            self.should_enable_ns = false;
            return false;
        }
        if self.ns.is_some() && enable != self.should_enable_ns {
            log::error!("Platform NS state can't be modified while recording");
            return false;
        }
        self.should_enable_ns = enable;
        true
    }

    pub fn aec_requested(&self) -> bool {
        self.should_enable_aec
    }

    pub fn ns_requested(&self) -> bool {
        self.should_enable_ns
    }

    pub fn is_attached(&self) -> bool {
        self.aec.is_some() || self.ns.is_some()
    }

    /// Create the supported effects for `session_id` and apply the requests.
    pub fn attach(&mut self, session_id: SessionId) {
        log::debug!("attach(session_id={})", session_id);
        if self.is_attached() {
            log::warn!("Effects already attached, releasing previous instances");
            self.detach();
        }

        if self.is_aec_supported() {
            self.aec = Self::create_effect(
                &*self.platform,
                EffectKind::Aec,
                session_id,
                self.should_enable_aec,
            );
        }
        if self.is_ns_supported() {
            self.ns = Self::create_effect(
                &*self.platform,
                EffectKind::Ns,
                session_id,
                self.should_enable_ns,
            );
        }
    }

    fn create_effect(
        platform: &dyn EffectsPlatform,
        kind: EffectKind,
        session_id: SessionId,
        enable: bool,
    ) -> Option<Box<dyn PlatformEffect>> {
        let mut effect = match platform.create(kind, session_id) {
            Ok(effect) => effect,
            Err(e) => {
                log::error!("Failed to create {:?} for session {}: {}", kind, session_id, e);
                return None;
            }
        };
        if let Err(e) = effect.set_enabled(enable) {
            log::error!("Failed to set {:?} enabled={}: {}", kind, enable, e);
        }
        log::info!(
            "{:?}: {} (session {})",
            kind,
            if effect.enabled() { "enabled" } else { "disabled" },
            session_id
        );
        Some(effect)
    }

    /// Release both effects. Safe to call when nothing is attached.
    pub fn detach(&mut self) {
        log::debug!("detach");
        self.aec = None;
        self.ns = None;
    }
}
