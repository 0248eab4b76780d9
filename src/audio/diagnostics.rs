//! Off-real-time diagnostics: delayed session verification, periodic playout
//! statistics, and device state dumps.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use super::device::{AudioBackend, DeviceSnapshot, RecordingConfig};

/// Runs diagnostics on its own small tokio runtime so nothing here ever
/// competes with the audio threads.
pub struct DiagnosticsScheduler {
    runtime: Option<Runtime>,
}

impl DiagnosticsScheduler {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("audio-diag")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    fn spawn<F>(&self, fut: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(rt) => ScheduledTask {
                handle: Some(rt.spawn(fut)),
            },
            None => ScheduledTask { handle: None },
        }
    }

    /// Run `job` once after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, job: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            job();
        })
    }

    /// Run `job` every `period`, first run after one full period.
    pub fn schedule_every<F>(&self, period: Duration, mut job: F) -> ScheduledTask
    where
        F: FnMut() + Send + 'static,
    {
        self.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                job();
            }
        })
    }
}

impl Drop for DiagnosticsScheduler {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

/// A pending diagnostic job. Cancelled when dropped.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn cancel(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Outcome of comparing our recording session with what the OS reports active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMatch {
    Unknown,
    Matching,
    Mismatch,
}

/// Lock-free cell so the host can read the last verification result.
#[derive(Debug)]
pub struct SessionMatchCell(AtomicU8);

impl Default for SessionMatchCell {
    fn default() -> Self {
        Self(AtomicU8::new(0))
    }
}

impl SessionMatchCell {
    pub fn get(&self) -> SessionMatch {
        match self.0.load(Ordering::Acquire) {
            1 => SessionMatch::Matching,
            2 => SessionMatch::Mismatch,
            _ => SessionMatch::Unknown,
        }
    }

    pub fn set(&self, value: SessionMatch) {
        let raw = match value {
            SessionMatch::Unknown => 0,
            SessionMatch::Matching => 1,
            SessionMatch::Mismatch => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// Whether any active configuration looks like the session we opened.
///
/// Advisory only: the OS list can lag behind a device that just started.
pub fn matches_active_session(expected: &RecordingConfig, active: &[RecordingConfig]) -> bool {
    active.iter().any(|cfg| {
        let same_format = cfg.sample_rate == expected.sample_rate
            && cfg.channels == expected.channels
            && cfg.format == expected.format;
        let same_place = match (cfg.location, expected.location) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let same_session = match (cfg.session_id, expected.session_id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let same_source = match (cfg.source, expected.source) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let same_owner = match (cfg.owner_pid, expected.owner_pid) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        same_format && same_place && same_session && same_source && same_owner
    })
}

/// Query the backend and store the result in `cell`.
pub fn verify_recording_session(
    backend: &dyn AudioBackend,
    expected: &RecordingConfig,
    cell: &SessionMatchCell,
) -> SessionMatch {
    let result = match backend.active_recording_configs() {
        Ok(active) => {
            log::debug!("Active recording configurations: {}", active.len());
            if matches_active_session(expected, &active) {
                SessionMatch::Matching
            } else {
                log::warn!(
                    "Recording session {:?} not found among {} active configurations",
                    expected.session_id,
                    active.len()
                );
                SessionMatch::Mismatch
            }
        }
        Err(e) => {
            log::warn!("Cannot list active recording configurations: {}", e);
            SessionMatch::Unknown
        }
    };
    cell.set(result);
    result
}

/// Dump a device snapshot to the log, used when a loop fails to join in time.
pub fn log_audio_state(tag: &str, snapshot: &DeviceSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(json) => log::error!("{} audio state: {}", tag, json),
        Err(e) => log::error!("{} audio state unavailable: {}", tag, e),
    }
}
