//! Session state flags shared across threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Externally visible lifecycle state of a [`crate::session::Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Playing,
    Paused,
    /// Transient guard while a stop is in flight.
    Stopping,
}

#[derive(Debug, Default)]
struct Flags {
    playing: AtomicBool,
    paused: AtomicBool,
    stopping: AtomicBool,
}

/// Cloneable handle to the session's lifecycle flags.
///
/// Readers on any thread see a consistent enough view for reporting; transitions are only
/// made by the session while it holds its own lock.
#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    flags: Arc<Flags>,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        let f = &self.flags;
        if f.stopping.load(Ordering::Acquire) {
            SessionState::Stopping
        } else if f.paused.load(Ordering::Acquire) {
            SessionState::Paused
        } else if f.playing.load(Ordering::Acquire) {
            SessionState::Playing
        } else {
            SessionState::Idle
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.stopping.load(Ordering::Acquire)
    }

    /// Enter Stopping. Returns `false` if a stop was already in flight.
    pub(crate) fn begin_stop(&self) -> bool {
        !self.flags.stopping.swap(true, Ordering::AcqRel)
    }

    /// Leave Stopping into Idle.
    pub(crate) fn finish_stop(&self) {
        self.flags.playing.store(false, Ordering::Release);
        self.flags.paused.store(false, Ordering::Release);
        self.flags.stopping.store(false, Ordering::Release);
    }

    pub(crate) fn set_playing(&self) {
        self.flags.paused.store(false, Ordering::Release);
        self.flags.playing.store(true, Ordering::Release);
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.flags.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn set_idle(&self) {
        self.flags.playing.store(false, Ordering::Release);
        self.flags.paused.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        assert_eq!(SessionStatus::new().state(), SessionState::Idle);
    }

    #[test]
    fn stopping_wins_over_other_flags() {
        let s = SessionStatus::new();
        s.set_playing();
        s.set_paused(true);
        assert_eq!(s.state(), SessionState::Paused);
        assert!(s.begin_stop());
        assert!(!s.begin_stop());
        assert_eq!(s.state(), SessionState::Stopping);
        s.finish_stop();
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn clones_share_flags() {
        let s = SessionStatus::new();
        let view = s.clone();
        s.set_playing();
        assert_eq!(view.state(), SessionState::Playing);
    }
}
