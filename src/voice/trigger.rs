//! Wake word trigger debouncing
//!
//! Turns a noisy per-frame keyword probability into a single activation edge.
//! Consecutive positive frames push a counter up; crossing `trigger_level`
//! fires once and drops the counter into a negative cooldown window that is
//! sized to roughly eight 2048-sample reference chunks regardless of the
//! actual frame size.

/// Frame size the cooldown window is expressed in
const REFERENCE_CHUNK: i64 = 2048;

/// Cooldown length in reference chunks
const COOLDOWN_CHUNKS: i64 = 8;

/// Debounces wake word scores into activation edges
#[derive(Debug, Clone)]
pub struct TriggerDetector {
    sensitivity: f32,
    trigger_level: i64,
    cooldown: i64,
    activation: i64,
}

impl TriggerDetector {
    /// Create a detector
    ///
    /// # Arguments
    ///
    /// * `chunk_size` - samples per frame, scales the cooldown window
    /// * `sensitivity` - a frame counts as positive when `score > 1 - sensitivity`
    /// * `trigger_level` - positive frames beyond which activation fires
    #[must_use]
    pub fn new(chunk_size: usize, sensitivity: f32, trigger_level: u32) -> Self {
        let chunk = i64::try_from(chunk_size.max(1)).unwrap_or(i64::MAX);
        let window = COOLDOWN_CHUNKS * REFERENCE_CHUNK;

        Self {
            sensitivity: sensitivity.clamp(0.0, 1.0),
            trigger_level: i64::from(trigger_level),
            cooldown: -((window + chunk - 1) / chunk),
            activation: 0,
        }
    }

    /// Feed one frame's keyword score
    ///
    /// Returns `true` only on the frame where the trigger level is first
    /// exceeded.
    pub fn update(&mut self, score: f32) -> bool {
        let chunk_activated = score > 1.0 - self.sensitivity;

        if chunk_activated || self.activation < 0 {
            self.activation += 1;
            let has_activated = self.activation > self.trigger_level;

            // A positive frame during cooldown restarts the cooldown
            if has_activated || (chunk_activated && self.activation < 0) {
                self.activation = self.cooldown;
            }

            if has_activated {
                tracing::trace!(score, cooldown = self.cooldown, "trigger level exceeded");
            }
            return has_activated;
        }

        if self.activation > 0 {
            self.activation -= 1;
        }

        false
    }

    /// Current counter value
    #[must_use]
    pub const fn activation(&self) -> i64 {
        self.activation
    }

    /// Length of the cooldown window in frames
    #[must_use]
    pub const fn cooldown_frames(&self) -> u64 {
        self.cooldown.unsigned_abs()
    }

    /// Clear the counter and any cooldown
    pub const fn reset(&mut self) {
        self.activation = 0;
    }
}
