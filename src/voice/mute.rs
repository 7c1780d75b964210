//! Listening suspension shared between the capture thread and the node
//!
//! While muted the capture loop keeps reading frames but drops them before
//! scoring. Every mute carries an optional expiry so a lost unmute cannot
//! leave the device deaf.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    /// Mute requested by a peer
    muted: bool,
    expires_at: Option<Instant>,
    /// Local playback hold, independent of peer requests
    held_until: Option<Instant>,
}

/// Mute flag with optional auto-expiry
///
/// Peer mutes and the local playback hold are tracked apart: listening is
/// suspended while either is in force, and each is released on its own.
#[derive(Debug, Default)]
pub struct MuteState {
    inner: Mutex<Inner>,
}

impl MuteState {
    /// Create an unmuted state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mute for up to `timeout`, or until unmuted when `None`
    ///
    /// Ignored while a peer mute is already in force. Returns whether the
    /// state changed.
    pub fn mute(&self, timeout: Option<Duration>) -> bool {
        self.mute_at(Instant::now(), timeout)
    }

    /// [`mute`](Self::mute) with an explicit clock
    pub fn mute_at(&self, now: Instant, timeout: Option<Duration>) -> bool {
        let mut inner = self.lock();
        Self::refresh(&mut inner, now);
        if inner.muted {
            return false;
        }

        inner.muted = true;
        inner.expires_at = timeout.map(|t| now + t);
        tracing::info!(?timeout, "listening muted");
        true
    }

    /// Hold listening muted until at least `now + hold`
    ///
    /// Used for local playback. Extends an earlier hold and leaves any peer
    /// mute untouched.
    pub fn hold_at(&self, now: Instant, hold: Duration) {
        let mut inner = self.lock();
        Self::refresh(&mut inner, now);
        let until = now + hold;

        if inner.held_until.is_none() {
            tracing::debug!(?hold, "muted for playback");
        }
        inner.held_until = Some(inner.held_until.map_or(until, |at| at.max(until)));
    }

    /// [`hold_at`](Self::hold_at) from the current instant
    pub fn hold(&self, hold: Duration) {
        self.hold_at(Instant::now(), hold);
    }

    /// Drop the playback hold
    ///
    /// Returns whether a hold was in force.
    pub fn release_hold(&self) -> bool {
        let released = self.lock().held_until.take().is_some();
        if released {
            tracing::debug!("playback hold released");
        }
        released
    }

    /// Clear a peer mute
    ///
    /// A playback hold stays in force. Returns whether the state changed.
    pub fn unmute(&self) -> bool {
        let mut inner = self.lock();
        let was_muted = inner.muted;
        inner.muted = false;
        inner.expires_at = None;

        if was_muted {
            tracing::info!("listening unmuted");
        }
        was_muted
    }

    /// Whether listening is currently suspended
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.is_muted_at(Instant::now())
    }

    /// [`is_muted`](Self::is_muted) with an explicit clock
    ///
    /// Elapsed expiries are cleared.
    #[must_use]
    pub fn is_muted_at(&self, now: Instant) -> bool {
        Self::refresh(&mut self.lock(), now)
    }

    /// Pending peer mute expiry, if muted with a timeout
    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.lock().expires_at
    }

    /// Apply expiries and return whether still muted
    fn refresh(inner: &mut Inner, now: Instant) -> bool {
        if inner.muted && inner.expires_at.is_some_and(|at| now >= at) {
            tracing::info!("mute expired");
            inner.muted = false;
            inner.expires_at = None;
        }
        if inner.held_until.is_some_and(|at| now >= at) {
            inner.held_until = None;
        }
        inner.muted || inner.held_until.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded state is plain fields; a panicked holder cannot
        // leave it inconsistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
