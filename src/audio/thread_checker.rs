//! Control-thread ownership for pipeline operations.
//!
//! A checker is owned by the thread that constructs it. Calls from any other
//! thread are a programming error and panic. Ownership moves only
//! explicitly: `detach` releases it and `bind_to` hands it to a named thread,
//! which is how a pipeline moves to a new control thread between sessions.

use std::sync::Mutex;
use std::thread::{self, ThreadId};

#[derive(Debug)]
pub struct ThreadChecker {
    owner: Mutex<Option<ThreadId>>,
}

impl ThreadChecker {
    /// Owned by the calling thread.
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(Some(thread::current().id())),
        }
    }

    /// Bind to an explicit owner, replacing any previous binding.
    pub fn bind_to(&self, owner: ThreadId) {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = Some(owner);
    }

    /// Release ownership. Every check fails until `bind_to` names a new owner.
    pub fn detach(&self) {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_current(&self) -> bool {
        self.owner() == Some(thread::current().id())
    }

    /// Panics when called off the owning thread.
    #[track_caller]
    pub fn check(&self) {
        let current = thread::current().id();
        match self.owner() {
            Some(owner) => assert!(
                owner == current,
                "audio control operation called from {:?}, which is not the owning control thread {:?}",
                current,
                owner
            ),
            None => panic!(
                "audio control operation called from {:?} while detached; bind_to() a control thread first",
                current
            ),
        }
    }
}

impl Default for ThreadChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn owned_by_constructing_thread() {
        let checker = Arc::new(ThreadChecker::new());
        assert!(checker.is_current());

        let other = checker.clone();
        let on_other = thread::spawn(move || other.is_current()).join().unwrap();
        assert!(!on_other);
    }

    #[test]
    fn first_caller_elsewhere_does_not_take_ownership() {
        let checker = Arc::new(ThreadChecker::new());
        let other = checker.clone();
        let result = thread::spawn(move || other.check()).join();
        assert!(result.is_err());
        checker.check();
    }

    #[test]
    fn detached_checker_rejects_every_thread() {
        let checker = Arc::new(ThreadChecker::new());
        checker.detach();
        assert_eq!(checker.owner(), None);
        assert!(!checker.is_current());

        let other = checker.clone();
        let result = thread::spawn(move || other.check()).join();
        assert!(result.is_err());
    }

    #[test]
    fn bind_to_after_detach_hands_over_ownership() {
        let checker = Arc::new(ThreadChecker::new());
        checker.detach();

        let other = checker.clone();
        thread::spawn(move || {
            other.bind_to(thread::current().id());
            other.check();
        })
        .join()
        .unwrap();
        assert!(!checker.is_current());
    }

    #[test]
    fn explicit_binding_moves_ownership() {
        let checker = Arc::new(ThreadChecker::new());
        checker.check();

        let other = checker.clone();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let worker = thread::spawn(move || {
            go_rx.recv().unwrap();
            other.check();
        });
        checker.bind_to(worker.thread().id());
        go_tx.send(()).unwrap();
        worker.join().unwrap();
        assert!(!checker.is_current());
    }
}
