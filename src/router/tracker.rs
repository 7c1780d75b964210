//! Per-utterance ordering guard for outbound commands

use super::command::Command;

/// Where the outbound stream is within an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtterancePhase {
    /// Between utterances
    Idle,
    /// An utterance is streaming on the current connection
    Open,
    /// The connection dropped mid-utterance; its tail is discarded
    Orphaned,
}

/// Decides whether a command may be sent on the current connection
///
/// Keeps each utterance to `START_SPEAK? CONTINUE* (FINISH | CANCEL)` on a
/// single connection. An utterance whose connection was lost is orphaned and
/// its remaining commands are dropped until its terminal command passes.
#[derive(Debug)]
pub struct UtteranceTracker {
    phase: UtterancePhase,
}

impl Default for UtteranceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceTracker {
    /// Create a tracker between utterances
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: UtterancePhase::Idle,
        }
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> UtterancePhase {
        self.phase
    }

    /// Record a command and return whether it should be sent
    pub fn admit(&mut self, command: Command) -> bool {
        let (next, send) = match (self.phase, command) {
            // A fresh activation always starts a new utterance
            (_, Command::StartSpeak) => (UtterancePhase::Open, true),
            (UtterancePhase::Orphaned, c) if c.is_terminal() => (UtterancePhase::Idle, false),
            (UtterancePhase::Orphaned, _) => (UtterancePhase::Orphaned, false),
            (_, c) if c.is_terminal() => (UtterancePhase::Idle, true),
            (_, _) => (UtterancePhase::Open, true),
        };

        if !send {
            tracing::debug!(%command, "dropping command of orphaned utterance");
        }

        self.phase = next;
        send
    }

    /// Mark the connection as lost
    ///
    /// An open utterance becomes orphaned.
    pub fn connection_lost(&mut self) {
        if self.phase == UtterancePhase::Open {
            tracing::warn!("router connection lost mid-utterance");
            self.phase = UtterancePhase::Orphaned;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_utterance_passes() {
        let mut t = UtteranceTracker::new();
        assert!(t.admit(Command::StartSpeak));
        assert!(t.admit(Command::Continue));
        assert!(t.admit(Command::Continue));
        assert_eq!(t.phase(), UtterancePhase::Open);
        assert!(t.admit(Command::Finish));
        assert_eq!(t.phase(), UtterancePhase::Idle);
    }

    #[test]
    fn remote_wake_utterance_without_start() {
        let mut t = UtteranceTracker::new();
        assert!(t.admit(Command::Continue));
        assert!(t.admit(Command::Cancel));
        assert_eq!(t.phase(), UtterancePhase::Idle);
    }

    #[test]
    fn orphaned_tail_is_dropped() {
        let mut t = UtteranceTracker::new();
        t.admit(Command::StartSpeak);
        t.admit(Command::Continue);
        t.connection_lost();

        assert!(!t.admit(Command::Continue));
        assert!(!t.admit(Command::Finish));
        assert_eq!(t.phase(), UtterancePhase::Idle);

        assert!(t.admit(Command::StartSpeak));
    }

    #[test]
    fn new_activation_supersedes_orphan() {
        let mut t = UtteranceTracker::new();
        t.admit(Command::StartSpeak);
        t.connection_lost();

        assert!(t.admit(Command::StartSpeak));
        assert_eq!(t.phase(), UtterancePhase::Open);
    }

    #[test]
    fn idle_connection_loss_is_harmless() {
        let mut t = UtteranceTracker::new();
        t.connection_lost();
        assert_eq!(t.phase(), UtterancePhase::Idle);
        assert!(t.admit(Command::Continue));
    }
}
