use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Thread-lifecycle state machine shared by the tracker, the `LocalMapper`
/// worker thread and the loop closer.
///
/// Each flag named in the concurrency model owns its own mutex (no
/// struct-wide lock), matching the upstream source's individually-guarded
/// booleans. `abort_ba` is the one exception: it is polled from inside the
/// optimizer's hot loop, so it is a bare atomic rather than a mutex, and is
/// shared by `Arc` with whatever `OptimizerBridge` the mapper calls.
pub struct Coordinator {
    stopped: Mutex<bool>,
    stop_requested: Mutex<bool>,
    not_stop: Mutex<bool>,
    finish_requested: Mutex<bool>,
    finished: Mutex<bool>,
    accept_keyframes: Mutex<bool>,
    reset_requested: Mutex<bool>,
    abort_ba: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            stop_requested: Mutex::new(false),
            not_stop: Mutex::new(false),
            finish_requested: Mutex::new(false),
            finished: Mutex::new(false),
            accept_keyframes: Mutex::new(true),
            reset_requested: Mutex::new(false),
            abort_ba: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shared cancellation token every `OptimizerBridge` call is handed.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort_ba.clone()
    }

    pub fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::Release);
    }

    pub(crate) fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::Release);
    }

    /// Requested by the loop closer (or any caller) to pause the mapper
    /// between phases; also raises the BA abort flag, since a stop mid-BA
    /// should interrupt it rather than let it run to completion.
    pub fn request_stop(&self) {
        *self.stop_requested.lock().unwrap() = true;
        self.interrupt_ba();
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_requested.lock().unwrap()
    }

    /// Called by the mapper at its stop checkpoint: transitions to
    /// `stopped` if a stop was requested and nothing vetoed it via
    /// `set_not_stop`.
    pub fn stop(&self) -> bool {
        let requested = *self.stop_requested.lock().unwrap();
        let vetoed = *self.not_stop.lock().unwrap();
        if requested && !vetoed {
            *self.stopped.lock().unwrap() = true;
            true
        } else {
            false
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    /// Veto an incoming stop request (used by a caller in a critical
    /// section, e.g. mid local-BA commit). Returns `false` (and leaves the
    /// veto unset) if the mapper is already stopped.
    pub fn set_not_stop(&self, value: bool) -> bool {
        if value && self.is_stopped() {
            return false;
        }
        *self.not_stop.lock().unwrap() = value;
        true
    }

    /// Resume a stopped mapper, clearing stop/stopped state. Queued
    /// keyframes are discarded by the caller (`LocalMapper::release`); this
    /// only flips the coordination flags.
    pub fn release(&self) {
        *self.stopped.lock().unwrap() = false;
        *self.stop_requested.lock().unwrap() = false;
    }

    pub fn accept_keyframes(&self) -> bool {
        *self.accept_keyframes.lock().unwrap()
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        *self.accept_keyframes.lock().unwrap() = value;
    }

    pub fn request_finish(&self) {
        *self.finish_requested.lock().unwrap() = true;
        self.interrupt_ba();
    }

    pub fn check_finish(&self) -> bool {
        *self.finish_requested.lock().unwrap()
    }

    pub(crate) fn set_finished(&self) {
        *self.finished.lock().unwrap() = true;
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap()
    }

    /// Request a reset and block until the mapper has observed and
    /// serviced it (clearing the keyframe queue and recently-added list).
    /// Spins on a short sleep rather than a condvar, matching the worker
    /// loop's own polling discipline.
    pub fn request_reset(&self) {
        *self.reset_requested.lock().unwrap() = true;
        while *self.reset_requested.lock().unwrap() {
            std::thread::sleep(Duration::from_millis(3));
        }
    }

    pub fn reset_requested(&self) -> bool {
        *self.reset_requested.lock().unwrap()
    }

    /// Called by the mapper once it has cleared its queue and watch list,
    /// unblocking any caller waiting in `request_reset`.
    pub(crate) fn clear_reset_request(&self) {
        *self.reset_requested.lock().unwrap() = false;
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_coordinator_accepts_keyframes_and_is_not_stopped() {
        let c = Coordinator::new();
        assert!(c.accept_keyframes());
        assert!(!c.is_stopped());
        assert!(!c.check_finish());
    }

    #[test]
    fn request_stop_then_stop_transitions_to_stopped() {
        let c = Coordinator::new();
        c.request_stop();
        assert!(c.stop());
        assert!(c.is_stopped());
    }

    #[test]
    fn set_not_stop_vetoes_a_pending_stop_request() {
        let c = Coordinator::new();
        c.request_stop();
        assert!(c.set_not_stop(true));
        assert!(!c.stop());
        assert!(!c.is_stopped());
    }

    #[test]
    fn set_not_stop_fails_once_already_stopped() {
        let c = Coordinator::new();
        c.request_stop();
        assert!(c.stop());
        assert!(!c.set_not_stop(true));
    }

    #[test]
    fn release_clears_stop_state() {
        let c = Coordinator::new();
        c.request_stop();
        c.stop();
        c.release();
        assert!(!c.is_stopped());
        assert!(!c.stop_requested());
    }

    #[test]
    fn interrupt_ba_sets_the_shared_abort_flag() {
        let c = Coordinator::new();
        let flag = c.abort_flag();
        assert!(!flag.load(Ordering::Acquire));
        c.interrupt_ba();
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn request_finish_raises_abort_and_is_observable() {
        let c = Coordinator::new();
        c.request_finish();
        assert!(c.check_finish());
        assert!(c.abort_flag().load(Ordering::Acquire));
    }

    #[test]
    fn request_reset_unblocks_once_serviced() {
        let c = Arc::new(Coordinator::new());
        let c2 = c.clone();
        let handle = std::thread::spawn(move || {
            c2.request_reset();
        });
        // give the requester a moment to set the flag, then service it
        std::thread::sleep(Duration::from_millis(10));
        assert!(c.reset_requested());
        c.clear_reset_request();
        handle.join().unwrap();
        assert!(!c.reset_requested());
    }
}
