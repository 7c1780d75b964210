//! Utterance endpointing
//!
//! After an activation every frame is buffered and streamed while VAD
//! probabilities decide when speech began and when it ended. Two deadlines
//! bound the utterance: a false-start window that cancels when no speech
//! shows up, and a silence window that finishes once speech has stopped.
//!
//! Deadlines are plain values polled by the capture loop, so cancelling one
//! after it has already elapsed is a no-op rather than a race.

use std::time::{Duration, Instant};

use super::frame::AudioFrame;
use crate::config::ListenConfig;

/// Listening lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseState {
    /// Only the trigger detector runs
    Idle,
    /// Activated, waiting for speech to begin
    Activated,
    /// Speech began, waiting for it to stop
    ListeningForSilence,
}

/// What started the current utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationSource {
    /// The wake word detector fired
    Keyword,
    /// The router asked the node to listen
    Remote,
}

/// Events emitted by the listening pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// An utterance started
    Activated {
        /// What caused it
        source: ActivationSource,
    },
    /// One frame of the utterance, as little-endian PCM16
    Chunk(Vec<u8>),
    /// The utterance ended
    ///
    /// `utterance` is a snapshot of everything streamed, present only when
    /// speech was detected.
    Finished {
        speech_detected: bool,
        utterance: Option<Vec<u8>>,
    },
}

/// A one-shot deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Arm to fire `after` from `now`, replacing any pending deadline
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.at = Some(now + after);
    }

    /// Disarm; harmless if not pending
    pub const fn cancel(&mut self) {
        self.at = None;
    }

    /// Whether the deadline is armed
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.at.is_some()
    }

    /// Disarm and return `true` if the deadline has elapsed at `now`
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.at {
            Some(at) if now >= at => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}

/// Endpoint detection state machine
///
/// Owns the utterance buffer exclusively. Finished utterances leave as an
/// owned snapshot inside [`ListenerEvent::Finished`].
#[derive(Debug)]
pub struct PhraseStateMachine {
    config: ListenConfig,
    state: PhraseState,
    speech_detected: bool,
    utterance: Vec<u8>,
    false_start: Deadline,
    silence: Deadline,
}

impl PhraseStateMachine {
    /// Create an idle state machine
    #[must_use]
    pub const fn new(config: ListenConfig) -> Self {
        Self {
            config,
            state: PhraseState::Idle,
            speech_detected: false,
            utterance: Vec::new(),
            false_start: Deadline { at: None },
            silence: Deadline { at: None },
        }
    }

    #[must_use]
    pub const fn state(&self) -> PhraseState {
        self.state
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state != PhraseState::Idle
    }

    #[must_use]
    pub const fn speech_detected(&self) -> bool {
        self.speech_detected
    }

    /// Bytes buffered for the current utterance
    #[must_use]
    pub fn utterance_len(&self) -> usize {
        self.utterance.len()
    }

    /// Whether the false-start deadline is armed
    #[must_use]
    pub const fn false_start_pending(&self) -> bool {
        self.false_start.is_pending()
    }

    /// Whether the silence deadline is armed
    #[must_use]
    pub const fn silence_pending(&self) -> bool {
        self.silence.is_pending()
    }

    /// Start an utterance
    ///
    /// `false_start` overrides the configured wait window. Returns `None`
    /// when already active; a remote request then only re-arms the
    /// false-start window if speech has not begun yet.
    pub fn activate(
        &mut self,
        source: ActivationSource,
        false_start: Option<Duration>,
        now: Instant,
    ) -> Option<ListenerEvent> {
        let window = false_start.unwrap_or(self.config.false_start);

        if self.is_active() {
            if source == ActivationSource::Remote && !self.speech_detected {
                tracing::debug!(window_ms = millis(window), "extending false-start window");
                self.false_start.arm(now, window);
            }
            return None;
        }

        tracing::debug!(?source, window_ms = millis(window), "utterance started");
        self.state = PhraseState::Activated;
        self.speech_detected = false;
        self.utterance.clear();
        self.silence.cancel();
        self.false_start.arm(now, window);

        Some(ListenerEvent::Activated { source })
    }

    /// Feed one frame with its VAD probability
    ///
    /// Returns the chunk event to stream, or `None` when idle.
    pub fn listen(&mut self, frame: &AudioFrame, vad: f32, now: Instant) -> Option<ListenerEvent> {
        if !self.is_active() {
            return None;
        }

        let bytes = frame.to_le_bytes();
        self.utterance.extend_from_slice(&bytes);

        if vad > self.config.speech_threshold {
            if !self.speech_detected {
                tracing::debug!(vad, "speech detected");
            }
            self.false_start.cancel();
            self.silence.cancel();
            self.speech_detected = true;
            self.state = PhraseState::ListeningForSilence;
        } else if vad < self.config.silence_threshold
            && self.speech_detected
            && !self.silence.is_pending()
        {
            tracing::trace!(vad, "silence started");
            self.silence.arm(now, self.config.silence);
        }

        Some(ListenerEvent::Chunk(bytes))
    }

    /// Check deadlines at `now`
    ///
    /// Returns the finish event when the utterance ended.
    pub fn poll(&mut self, now: Instant) -> Option<ListenerEvent> {
        if !self.is_active() {
            return None;
        }

        if self.silence.fire(now) {
            let utterance = std::mem::take(&mut self.utterance);
            tracing::debug!(bytes = utterance.len(), "utterance finished");
            self.to_idle();
            return Some(ListenerEvent::Finished {
                speech_detected: true,
                utterance: Some(utterance),
            });
        }

        if self.false_start.fire(now) && !self.speech_detected {
            tracing::debug!("no speech before false-start deadline");
            self.to_idle();
            return Some(ListenerEvent::Finished {
                speech_detected: false,
                utterance: None,
            });
        }

        None
    }

    /// Drop any utterance in progress and disarm both deadlines
    pub fn shutdown(&mut self) {
        if self.is_active() {
            tracing::debug!(bytes = self.utterance.len(), "discarding utterance on shutdown");
        }
        self.to_idle();
    }

    fn to_idle(&mut self) {
        self.state = PhraseState::Idle;
        self.speech_detected = false;
        self.utterance.clear();
        self.false_start.cancel();
        self.silence.cancel();
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(20);

    fn machine() -> PhraseStateMachine {
        PhraseStateMachine::new(ListenConfig::default())
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![100; 320])
    }

    /// Feed frames with the given VAD values, polling after each
    fn feed(
        m: &mut PhraseStateMachine,
        start: Instant,
        offset: usize,
        vads: &[f32],
    ) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        for (i, &vad) in vads.iter().enumerate() {
            let now = start + FRAME * u32::try_from(offset + i).unwrap();
            events.extend(m.poll(now));
            events.extend(m.listen(&frame(), vad, now));
        }
        events
    }

    fn finishes(events: &[ListenerEvent]) -> Vec<&ListenerEvent> {
        events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::Finished { .. }))
            .collect()
    }

    #[test]
    fn deadline_fires_once() {
        let t0 = Instant::now();
        let mut d = Deadline::default();
        d.arm(t0, Duration::from_secs(1));

        assert!(!d.fire(t0 + Duration::from_millis(999)));
        assert!(d.fire(t0 + Duration::from_secs(1)));
        assert!(!d.fire(t0 + Duration::from_secs(2)));

        // Cancel after firing is a no-op
        d.cancel();
        assert!(!d.is_pending());
    }

    #[test]
    fn idle_ignores_frames() {
        let mut m = machine();
        assert!(m.listen(&frame(), 0.9, Instant::now()).is_none());
        assert_eq!(m.utterance_len(), 0);
        assert!(m.poll(Instant::now() + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn speech_then_silence_finishes_once() {
        let t0 = Instant::now();
        let mut m = machine();
        assert_eq!(
            m.activate(ActivationSource::Keyword, None, t0),
            Some(ListenerEvent::Activated {
                source: ActivationSource::Keyword
            })
        );

        // 10 frames of speech then 2s of quiet
        let mut vads = vec![0.9; 10];
        vads.extend(std::iter::repeat_n(0.1, 100));
        let events = feed(&mut m, t0, 0, &vads);

        let done = finishes(&events);
        assert_eq!(done.len(), 1);
        let ListenerEvent::Finished {
            speech_detected,
            utterance,
        } = done[0]
        else {
            unreachable!()
        };
        assert!(*speech_detected);
        // Silence armed at frame 10, deadline reached when frame 60 arrives
        assert_eq!(utterance.as_ref().unwrap().len(), 60 * 640);

        assert_eq!(m.state(), PhraseState::Idle);
        assert_eq!(m.utterance_len(), 0);
        assert!(!m.speech_detected());
    }

    #[test]
    fn no_speech_cancels_at_false_start() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Keyword, None, t0);

        let events = feed(&mut m, t0, 0, &[0.45; 250]);

        let done = finishes(&events);
        assert_eq!(
            done,
            vec![&ListenerEvent::Finished {
                speech_detected: false,
                utterance: None
            }]
        );
        assert_eq!(m.state(), PhraseState::Idle);
        assert_eq!(m.utterance_len(), 0);

        // Cancel emitted exactly at the 4s window (frame 200)
        let position = events
            .iter()
            .position(|e| matches!(e, ListenerEvent::Finished { .. }))
            .unwrap();
        let chunks_before = events[..position]
            .iter()
            .filter(|e| matches!(e, ListenerEvent::Chunk(_)))
            .count();
        assert_eq!(chunks_before, 200);
    }

    #[test]
    fn speech_cancels_false_start() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Keyword, None, t0);

        feed(&mut m, t0, 0, &[0.9]);
        assert!(!m.false_start_pending());
        assert_eq!(m.state(), PhraseState::ListeningForSilence);

        // Past the false-start window with speech continuing, no finish
        let events = feed(&mut m, t0, 1, &[0.9; 300]);
        assert!(finishes(&events).is_empty());
        assert!(m.is_active());
    }

    #[test]
    fn resumed_speech_cancels_silence() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Keyword, None, t0);

        feed(&mut m, t0, 0, &[0.9, 0.1, 0.1]);
        assert!(m.silence_pending());

        feed(&mut m, t0, 3, &[0.9]);
        assert!(!m.silence_pending());

        // Values between the thresholds neither start nor stop silence
        feed(&mut m, t0, 4, &[0.45; 100]);
        assert!(!m.silence_pending());
        assert!(m.is_active());
    }

    #[test]
    fn silence_timer_not_restarted_while_pending() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Keyword, None, t0);

        // Silence starts at frame 1; further quiet frames must not push it out
        let mut vads = vec![0.9];
        vads.extend(std::iter::repeat_n(0.1, 60));
        let events = feed(&mut m, t0, 0, &vads);

        assert_eq!(finishes(&events).len(), 1);
    }

    #[test]
    fn remote_wake_uses_caller_window() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Remote, Some(Duration::from_millis(500)), t0);

        assert!(m.poll(t0 + Duration::from_millis(499)).is_none());
        assert_eq!(
            m.poll(t0 + Duration::from_millis(500)),
            Some(ListenerEvent::Finished {
                speech_detected: false,
                utterance: None
            })
        );
    }

    #[test]
    fn activation_while_active_is_ignored() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Keyword, None, t0);
        feed(&mut m, t0, 0, &[0.2; 5]);
        let buffered = m.utterance_len();

        assert!(m.activate(ActivationSource::Keyword, None, t0).is_none());
        assert_eq!(m.utterance_len(), buffered);
    }

    #[test]
    fn remote_wake_while_active_extends_window() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Keyword, None, t0);

        let later = t0 + Duration::from_secs(3);
        assert!(
            m.activate(ActivationSource::Remote, Some(Duration::from_secs(4)), later)
                .is_none()
        );

        assert!(m.poll(t0 + Duration::from_secs(5)).is_none());
        assert!(m.poll(t0 + Duration::from_secs(7)).is_some());
    }

    #[test]
    fn shutdown_clears_state() {
        let t0 = Instant::now();
        let mut m = machine();
        m.activate(ActivationSource::Keyword, None, t0);
        feed(&mut m, t0, 0, &[0.9, 0.1]);

        m.shutdown();
        assert_eq!(m.state(), PhraseState::Idle);
        assert_eq!(m.utterance_len(), 0);
        assert!(!m.false_start_pending());
        assert!(!m.silence_pending());
        assert!(m.poll(t0 + Duration::from_secs(60)).is_none());
    }
}
