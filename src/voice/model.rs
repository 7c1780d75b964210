//! Frame scoring: wake word predictions and voice activity
//!
//! The wake word network runs out of process. [`SidecarWakeModel`] streams
//! frames to a scorer command over stdin and reads one JSON object of
//! `{"keyword": score}` per frame back from stdout.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use super::frame::AudioFrame;
use crate::{Error, Result};

/// Keyword scores for one frame
pub type Predictions = HashMap<String, f32>;

/// Scores frames for wake words
pub trait WakeWordModel: Send {
    /// Score one frame
    ///
    /// # Errors
    ///
    /// Returns error if the model fails or answers in an unexpected shape
    fn predict(&mut self, frame: &AudioFrame) -> Result<Predictions>;
}

/// Estimates the probability that a frame contains speech
pub trait VoiceActivityModel: Send {
    /// Probability in `[0.0, 1.0]`
    ///
    /// # Errors
    ///
    /// Returns error if the model fails
    fn probability(&mut self, frame: &AudioFrame) -> Result<f32>;
}

/// Extract a keyword's score, treating missing or invalid values as zero
#[must_use]
pub fn keyword_score(predictions: &Predictions, keyword: &str) -> f32 {
    predictions
        .get(keyword)
        .copied()
        .filter(|s| s.is_finite())
        .map_or(0.0, |s| s.clamp(0.0, 1.0))
}

/// Model that never detects anything
///
/// Leaves the node reachable only through remote wake requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWakeModel;

impl WakeWordModel for NullWakeModel {
    fn predict(&mut self, _frame: &AudioFrame) -> Result<Predictions> {
        Ok(Predictions::new())
    }
}

/// Energy-based voice activity estimate
///
/// Maps frame RMS linearly from `floor` (0.0) to `ceiling` (1.0).
#[derive(Debug, Clone, Copy)]
pub struct EnergyVad {
    floor: f32,
    ceiling: f32,
}

impl EnergyVad {
    /// Create an estimator; `ceiling` must exceed `floor`
    #[must_use]
    pub const fn new(floor: f32, ceiling: f32) -> Self {
        Self { floor, ceiling }
    }
}

impl VoiceActivityModel for EnergyVad {
    fn probability(&mut self, frame: &AudioFrame) -> Result<f32> {
        let span = self.ceiling - self.floor;
        if span <= 0.0 {
            return Err(Error::Model(format!(
                "vad ceiling {} not above floor {}",
                self.ceiling, self.floor
            )));
        }
        Ok(((frame.rms() - self.floor) / span).clamp(0.0, 1.0))
    }
}

/// Frames buffered for the scorer before new ones are refused
const SCORER_BACKLOG: usize = 4;

/// Wake word scorer running as a child process
///
/// Each frame is written as a little-endian `u32` byte count followed by
/// the PCM16 bytes; the child answers with a single JSON line. Pipe I/O
/// runs on helper threads so a stalled scorer costs at most the reply
/// budget per frame.
pub struct SidecarWakeModel {
    child: Child,
    frames: SyncSender<Vec<u8>>,
    replies: Receiver<io::Result<String>>,
    /// Frames sent whose reply has not been read yet
    unanswered: usize,
    reply_timeout: Duration,
}

impl SidecarWakeModel {
    /// Start the scorer command
    ///
    /// The command line is split on whitespace; no shell is involved. A
    /// reply that takes longer than `reply_timeout` fails that frame.
    ///
    /// # Errors
    ///
    /// Returns error if the command is empty or cannot be started
    pub fn spawn(command_line: &str, reply_timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("empty wake word model command".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Model(format!("failed to start {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Model("scorer stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Model("scorer stdout unavailable".to_string()))?;

        let (frames, frame_rx) = mpsc::sync_channel(SCORER_BACKLOG);
        let (reply_tx, replies) = mpsc::channel();

        std::thread::Builder::new()
            .name("wakenode-scorer-in".to_string())
            .spawn(move || feed_scorer(stdin, &frame_rx))?;
        std::thread::Builder::new()
            .name("wakenode-scorer-out".to_string())
            .spawn(move || read_scorer(BufReader::new(stdout), &reply_tx))?;

        tracing::info!(command = command_line, pid = child.id(), ?reply_timeout, "wake word scorer started");

        Ok(Self {
            child,
            frames,
            replies,
            unanswered: 0,
            reply_timeout,
        })
    }
}

impl WakeWordModel for SidecarWakeModel {
    fn predict(&mut self, frame: &AudioFrame) -> Result<Predictions> {
        let bytes = frame.to_le_bytes();
        let len = u32::try_from(bytes.len())
            .map_err(|_| Error::Model(format!("frame too large: {} bytes", bytes.len())))?;

        let mut message = Vec::with_capacity(4 + bytes.len());
        message.extend_from_slice(&len.to_le_bytes());
        message.extend_from_slice(&bytes);

        match self.frames.try_send(message) {
            Ok(()) => self.unanswered += 1,
            Err(TrySendError::Full(_)) => {
                return Err(Error::Model("scorer is not keeping up".to_string()));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::Model("scorer input closed".to_string()));
            }
        }

        // Replies come back in order; skip those for frames already given up on
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(Ok(line)) => {
                    self.unanswered = self.unanswered.saturating_sub(1);
                    if self.unanswered == 0 {
                        return parse_predictions(&line);
                    }
                }
                Ok(Err(e)) => return Err(Error::Model(format!("scorer read failed: {e}"))),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::Model(format!(
                        "scorer did not answer within {:?}",
                        self.reply_timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Model("scorer exited".to_string()));
                }
            }
        }
    }
}

impl Drop for SidecarWakeModel {
    fn drop(&mut self) {
        // Killing the child closes both pipes and ends the helper threads
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "scorer already stopped");
        }
        let _ = self.child.wait();
    }
}

fn feed_scorer(mut stdin: ChildStdin, frames: &Receiver<Vec<u8>>) {
    while let Ok(message) = frames.recv() {
        if let Err(e) = stdin.write_all(&message).and_then(|()| stdin.flush()) {
            tracing::debug!(error = %e, "scorer write failed");
            return;
        }
    }
}

fn read_scorer(mut stdout: BufReader<ChildStdout>, replies: &Sender<io::Result<String>>) {
    loop {
        let mut line = String::new();
        let reply = match stdout.read_line(&mut line) {
            Ok(0) => {
                tracing::debug!("scorer closed its output");
                return;
            }
            Ok(_) => Ok(line),
            Err(e) => Err(e),
        };
        let failed = reply.is_err();
        if replies.send(reply).is_err() || failed {
            return;
        }
    }
}

/// Parse one scorer reply
///
/// # Errors
///
/// Returns error unless the line is a JSON object of numbers
pub fn parse_predictions(line: &str) -> Result<Predictions> {
    serde_json::from_str::<Predictions>(line.trim())
        .map_err(|e| Error::Model(format!("malformed scorer reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keyword_scores_zero() {
        let mut p = Predictions::new();
        p.insert("alexa".to_string(), 0.9);
        assert!(keyword_score(&p, "hey_jarvis").abs() < f32::EPSILON);
        assert!((keyword_score(&p, "alexa") - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn invalid_scores_are_sanitized() {
        let mut p = Predictions::new();
        p.insert("a".to_string(), f32::NAN);
        p.insert("b".to_string(), 3.0);
        p.insert("c".to_string(), -1.0);
        assert!(keyword_score(&p, "a").abs() < f32::EPSILON);
        assert!((keyword_score(&p, "b") - 1.0).abs() < f32::EPSILON);
        assert!(keyword_score(&p, "c").abs() < f32::EPSILON);
    }

    #[test]
    fn parses_scorer_reply() {
        let p = parse_predictions("{\"hey_jarvis\": 0.75}\n").unwrap();
        assert!((p["hey_jarvis"] - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn rejects_malformed_reply() {
        assert!(matches!(parse_predictions("[0.5]"), Err(Error::Model(_))));
        assert!(matches!(
            parse_predictions("{\"hey_jarvis\": \"high\"}"),
            Err(Error::Model(_))
        ));
    }

    #[test]
    fn energy_vad_maps_rms() {
        let mut vad = EnergyVad::new(0.01, 0.06);
        assert!(vad.probability(&AudioFrame::silence(320)).unwrap().abs() < f32::EPSILON);

        let loud = AudioFrame::new([16_000, -16_000].repeat(160));
        assert!((vad.probability(&loud).unwrap() - 1.0).abs() < f32::EPSILON);

        // rms 0.035 sits halfway
        let mid = AudioFrame::from_f32(&[0.035, -0.035].repeat(160));
        let p = vad.probability(&mid).unwrap();
        assert!((p - 0.5).abs() < 0.01, "p = {p}");
    }

    #[test]
    fn energy_vad_rejects_inverted_range() {
        let mut vad = EnergyVad::new(0.06, 0.01);
        assert!(vad.probability(&AudioFrame::silence(10)).is_err());
    }

    #[test]
    fn null_model_predicts_nothing() {
        assert!(NullWakeModel.predict(&AudioFrame::silence(320)).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn stalled_scorer_fails_the_frame() {
        let mut model = SidecarWakeModel::spawn("sleep 60", Duration::from_millis(50)).unwrap();
        let started = Instant::now();
        for _ in 0..3 {
            let r = model.predict(&AudioFrame::silence(320));
            assert!(matches!(r, Err(Error::Model(_))), "{r:?}");
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn exited_scorer_fails_the_frame() {
        let mut model = SidecarWakeModel::spawn("true", Duration::from_secs(2)).unwrap();
        let r = model.predict(&AudioFrame::silence(320));
        assert!(matches!(r, Err(Error::Model(_))), "{r:?}");
    }

    #[test]
    fn empty_scorer_command_rejected() {
        assert!(matches!(
            SidecarWakeModel::spawn("   ", Duration::from_millis(20)),
            Err(Error::Config(_))
        ));
    }
}
