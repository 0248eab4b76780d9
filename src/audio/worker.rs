//! Dedicated real-time threads for the capture and playout loops.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O so the loops
//! never share an executor with diagnostics work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

/// Loop flag shared between the control thread and one real-time thread.
#[derive(Debug, Clone)]
pub struct KeepAlive(Arc<AtomicBool>);

impl KeepAlive {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Non-blocking; the loop notices at its next block boundary.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a running real-time loop.
pub struct RealtimeWorker {
    name: String,
    keep_alive: KeepAlive,
    handle: Option<JoinHandle<()>>,
    done_rx: mpsc::Receiver<()>,
}

impl RealtimeWorker {
    /// Spawn `body` on a named thread at real-time priority (best effort).
    pub fn spawn<F>(name: &str, priority: i32, body: F) -> Result<Self>
    where
        F: FnOnce(KeepAlive) + Send + 'static,
    {
        let keep_alive = KeepAlive::new();
        let (done_tx, done_rx) = mpsc::channel();

        let handle = {
            let keep_alive = keep_alive.clone();
            let thread_name = name.to_string();
            thread::Builder::new().name(thread_name.clone()).spawn(move || {
                if priority > 0 {
                    if let Err(e) = promote_to_realtime(priority) {
                        log::warn!("{}: running without real-time priority: {}", thread_name, e);
                    }
                }
                body(keep_alive);
                let _ = done_tx.send(());
            })?
        };

        Ok(Self {
            name: name.to_string(),
            keep_alive,
            handle: Some(handle),
            done_rx,
        })
    }

    /// Clear the loop flag and wait up to `timeout` for the thread to exit.
    ///
    /// Returns false on timeout; the thread is then detached and left to
    /// finish on its own.
    pub fn stop_and_join(mut self, timeout: Duration) -> bool {
        self.keep_alive.clear();
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        log::error!("{} thread panicked", self.name);
                    }
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::error!("Join of {} thread timed out after {:?}", self.name, timeout);
                self.handle.take();
                false
            }
        }
    }
}

impl Drop for RealtimeWorker {
    fn drop(&mut self) {
        self.keep_alive.clear();
    }
}

#[cfg(target_os = "linux")]
fn promote_to_realtime(priority: i32) -> Result<()> {
    // SAFETY: plain libc calls on the current thread with a zeroed, then filled, param block.
    let result = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if result != 0 {
        anyhow::bail!(
            "pthread_setschedparam(SCHED_FIFO, {}) failed: {}",
            priority,
            std::io::Error::from_raw_os_error(result)
        );
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn promote_to_realtime(_priority: i32) -> Result<()> {
    anyhow::bail!("real-time scheduling is only wired up on Linux")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cooperative_loop_exits_on_stop() {
        let worker = RealtimeWorker::spawn("test-loop", 0, |keep_alive| {
            while keep_alive.is_alive() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        assert!(worker.stop_and_join(Duration::from_secs(2)));
    }

    #[test]
    fn stuck_loop_times_out_without_blocking_forever() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = RealtimeWorker::spawn("test-stuck", 0, move |_keep_alive| {
            let _ = release_rx.recv();
        })
        .unwrap();

        let begun = Instant::now();
        assert!(!worker.stop_and_join(Duration::from_millis(50)));
        assert!(begun.elapsed() < Duration::from_secs(2));
        let _ = release_tx.send(());
    }
}
